use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use codex_provider_error::ProviderError;
use codex_provider_protocol::{
    JsonRpcError, RequestId, ServerNotification, TurnInterruptParams, TurnStatus,
    TurnSteerParams, TurnSteerResponse, UserInput,
};
use serde_json::Value;
use tokio::sync::watch;

use crate::connection::Connection;
use crate::transport::{EventHook, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Starting,
    Active,
    Completed,
    Interrupted,
    /// The turn ended with a failure status, or its connection went away
    /// before it finished.
    Failed,
    /// The turn's stream was dropped before the turn ended. The connection
    /// is back in its pool, so the session can no longer reach the turn.
    Detached,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Active)
    }

    pub(crate) fn for_status(status: TurnStatus) -> Self {
        match status {
            TurnStatus::Completed => Self::Completed,
            TurnStatus::Interrupted => Self::Interrupted,
            TurnStatus::Failed | TurnStatus::InProgress | TurnStatus::Unknown => Self::Failed,
        }
    }
}

struct SessionInner {
    thread_id: String,
    turn_id: String,
    state: watch::Sender<TurnState>,
    connection: Weak<Connection>,
}

/// One running turn on one connection.
///
/// Only the first terminal transition sticks: once a turn is `Completed` a
/// late interrupt acknowledgement does not change it, and once it is
/// `Interrupted` a late `turn/completed` does not either. The session only
/// borrows its connection and fails with `TransportClosed` after the pool
/// has dropped it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.inner.thread_id)
            .field("turn_id", &self.inner.turn_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        thread_id: impl Into<String>,
        turn_id: impl Into<String>,
        connection: &Arc<Connection>,
    ) -> Self {
        let (state, _rx) = watch::channel(TurnState::Starting);
        Self {
            inner: Arc::new(SessionInner {
                thread_id: thread_id.into(),
                turn_id: turn_id.into(),
                state,
                connection: Arc::downgrade(connection),
            }),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    pub fn turn_id(&self) -> &str {
        &self.inner.turn_id
    }

    pub fn state(&self) -> TurnState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TurnState::Active
    }

    pub fn watch(&self) -> watch::Receiver<TurnState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn activate(&self) -> bool {
        self.transition(TurnState::Starting, TurnState::Active)
    }

    /// Moves an active session to `state`. A no-op once any terminal state
    /// was reached.
    pub(crate) fn end(&self, state: TurnState) -> bool {
        self.transition(TurnState::Active, state)
    }

    /// Applies a terminal event seen on the connection's feed.
    fn observe(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Notification(ServerNotification::TurnCompleted(completed))
                if completed.thread_id == self.inner.thread_id
                    && completed.turn_id == self.inner.turn_id =>
            {
                self.end(TurnState::for_status(completed.status));
            }
            InboundEvent::Closed { .. } => {
                self.end(TurnState::Failed);
            }
            _ => {}
        }
    }

    fn transition(&self, from: TurnState, to: TurnState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(
                thread_id = %self.inner.thread_id,
                turn_id = %self.inner.turn_id,
                from = ?from,
                to = ?to,
                "turn state changed"
            );
        }
        changed
    }

    fn ensure_active(&self) -> Result<(), ProviderError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ProviderError::SessionInactive {
                thread_id: self.inner.thread_id.clone(),
                turn_id: self.inner.turn_id.clone(),
            })
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, ProviderError> {
        self.inner
            .connection
            .upgrade()
            .ok_or_else(|| ProviderError::transport_closed("session connection was dropped"))
    }

    /// Adds text to the running turn with `turn/steer`. The turn id is sent as
    /// `expectedTurnId` so the agent can refuse a steer aimed at a turn that
    /// has already moved on.
    pub async fn inject_message(
        &self,
        text: impl Into<String>,
    ) -> Result<TurnSteerResponse, ProviderError> {
        self.ensure_active()?;
        let connection = self.connection()?;
        connection
            .turn_steer(TurnSteerParams {
                thread_id: self.inner.thread_id.clone(),
                expected_turn_id: self.inner.turn_id.clone(),
                input: vec![UserInput::text(text)],
            })
            .await
    }

    /// Sends `turn/interrupt` and marks the session inactive as soon as the
    /// agent acknowledges it, without waiting for `turn/completed`.
    pub async fn interrupt(&self) -> Result<(), ProviderError> {
        self.ensure_active()?;
        let connection = self.connection()?;
        connection
            .turn_interrupt(TurnInterruptParams {
                thread_id: self.inner.thread_id.clone(),
                turn_id: self.inner.turn_id.clone(),
            })
            .await?;
        if !self.transition(TurnState::Active, TurnState::Interrupted) {
            tracing::debug!(
                thread_id = %self.inner.thread_id,
                turn_id = %self.inner.turn_id,
                state = ?self.state(),
                "turn reached a terminal state before the interrupt was acknowledged"
            );
        }
        Ok(())
    }

    /// Answers a request the agent raised during this turn, such as an
    /// approval prompt.
    pub async fn respond(
        &self,
        id: RequestId,
        outcome: Result<Value, JsonRpcError>,
    ) -> Result<(), ProviderError> {
        self.connection()?.respond(id, outcome).await
    }
}

#[derive(Default)]
struct TrackerState {
    session: Option<Session>,
    early: Vec<InboundEvent>,
}

/// Ends a session as soon as its connection reads `turn/completed` for it,
/// whether or not anyone is pulling the turn's stream.
///
/// The hook is registered before `turn/start` is sent, when the turn id is
/// not known yet; terminal events read before [`SessionTracker::attach`] are
/// held and applied on attach.
#[derive(Clone, Default)]
pub(crate) struct SessionTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl SessionTracker {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn hook(&self) -> EventHook {
        let tracker = self.clone();
        Arc::new(move |event: &InboundEvent| tracker.observe(event))
    }

    fn observe(&self, event: &InboundEvent) {
        if !matches!(
            event,
            InboundEvent::Notification(ServerNotification::TurnCompleted(_))
                | InboundEvent::Closed { .. }
        ) {
            return;
        }
        let mut state = self.state();
        match &state.session {
            Some(session) => session.observe(event),
            None => state.early.push(event.clone()),
        }
    }

    pub(crate) fn attach(&self, session: &Session) {
        let mut state = self.state();
        for event in std::mem::take(&mut state.early) {
            session.observe(&event);
        }
        state.session = Some(session.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportIo;
    use codex_provider_protocol::TurnCompletedNotification;

    fn completed(thread_id: &str, turn_id: &str, status: TurnStatus) -> InboundEvent {
        InboundEvent::Notification(ServerNotification::TurnCompleted(TurnCompletedNotification {
            thread_id: thread_id.to_string(),
            turn_id: turn_id.to_string(),
            status,
            error: None,
        }))
    }

    fn idle_connection() -> Arc<Connection> {
        let (client, _server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(client);
        Arc::new(Connection::new(TransportIo::new("test", reader, writer), None))
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let connection = idle_connection();
        let session = Session::new("thread-1", "turn-1", &connection);
        assert_eq!(session.state(), TurnState::Starting);
        assert!(!session.is_active());

        assert!(session.activate());
        assert!(session.is_active());
        assert!(!session.activate());

        assert!(session.transition(TurnState::Active, TurnState::Interrupted));
        assert!(!session.end(TurnState::Completed));
        assert_eq!(session.state(), TurnState::Interrupted);
        assert!(session.state().is_terminal());
    }

    #[tokio::test]
    async fn steering_a_finished_turn_is_rejected_locally() {
        let connection = idle_connection();
        let session = Session::new("thread-1", "turn-1", &connection);
        session.activate();
        session.end(TurnState::Completed);

        let err = session
            .inject_message("one more thing")
            .await
            .expect_err("inactive session");
        assert!(matches!(err, ProviderError::SessionInactive { .. }));
        assert!(matches!(
            session.interrupt().await,
            Err(ProviderError::SessionInactive { .. })
        ));
    }

    #[tokio::test]
    async fn watchers_see_state_changes() {
        let connection = idle_connection();
        let session = Session::new("thread-1", "turn-1", &connection);
        let mut watcher = session.watch();

        session.activate();
        watcher.changed().await.expect("state change");
        assert_eq!(*watcher.borrow_and_update(), TurnState::Active);
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_as_transport_closed() {
        let connection = idle_connection();
        let session = Session::new("thread-1", "turn-1", &connection);
        session.activate();
        drop(connection);

        assert!(matches!(
            session.interrupt().await,
            Err(ProviderError::TransportClosed { .. })
        ));
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn tracker_applies_completions_read_before_attach() {
        let connection = idle_connection();
        let tracker = SessionTracker::default();
        let hook = tracker.hook();
        hook(&completed("thread-1", "turn-other", TurnStatus::Completed));
        hook(&completed("thread-1", "turn-1", TurnStatus::Failed));

        let session = Session::new("thread-1", "turn-1", &connection);
        session.activate();
        tracker.attach(&session);
        assert_eq!(session.state(), TurnState::Failed);
    }

    #[tokio::test]
    async fn tracker_ends_attached_sessions_on_close() {
        let connection = idle_connection();
        let tracker = SessionTracker::default();
        let session = Session::new("thread-1", "turn-1", &connection);
        session.activate();
        tracker.attach(&session);

        let hook = tracker.hook();
        hook(&completed("thread-2", "turn-1", TurnStatus::Completed));
        assert!(session.is_active());
        hook(&InboundEvent::Closed {
            reason: "agent stdout closed".to_string(),
        });
        assert_eq!(session.state(), TurnState::Failed);
    }

    #[test]
    fn statuses_map_to_terminal_states() {
        assert_eq!(TurnState::for_status(TurnStatus::Completed), TurnState::Completed);
        assert_eq!(TurnState::for_status(TurnStatus::Interrupted), TurnState::Interrupted);
        assert_eq!(TurnState::for_status(TurnStatus::Unknown), TurnState::Failed);
        assert!(TurnState::Detached.is_terminal());
        assert!(!TurnState::Active.is_terminal());
    }
}
