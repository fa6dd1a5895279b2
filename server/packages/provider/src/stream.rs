use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use codex_provider_error::ProviderError;
use codex_provider_protocol::{
    DeltaKind, ItemNotification, RequestId, ServerNotification, TurnCompletedNotification,
    TurnStatus,
};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;

use crate::pool::PooledConnection;
use crate::session::{Session, TurnState};
use crate::transport::{InboundEvent, Subscription};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TurnStarted {
        turn_id: String,
    },
    ItemStarted {
        item_id: String,
        item_type: String,
    },
    Delta {
        item_id: String,
        kind: DeltaKind,
        delta: String,
    },
    ItemCompleted {
        item_id: String,
        item_type: String,
    },
    /// A request from the agent scoped to this turn's thread. Answer it with
    /// [`Session::respond`].
    ServerRequest {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Finished {
        status: TurnStatus,
    },
}

/// Items opened by `item/started` and not yet closed by `item/completed`.
#[derive(Debug, Default)]
pub struct StreamState {
    open: HashMap<String, String>,
    deltas: u64,
}

impl StreamState {
    /// Returns false if the item was already open.
    pub fn open_item(&mut self, item_id: &str, item_type: &str) -> bool {
        self.open
            .insert(item_id.to_string(), item_type.to_string())
            .is_none()
    }

    /// Returns false if the item was never opened.
    pub fn close_item(&mut self, item_id: &str) -> bool {
        self.open.remove(item_id).is_some()
    }

    pub fn record_delta(&mut self) {
        self.deltas += 1;
    }

    pub fn delta_count(&self) -> u64 {
        self.deltas
    }

    pub fn has_open_items(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn open_items(&self) -> Vec<String> {
        let mut items: Vec<String> = self.open.keys().cloned().collect();
        items.sort();
        items
    }
}

type ChunkResult = Result<StreamChunk, ProviderError>;

struct Translator {
    session: Session,
    events: Option<Subscription>,
    state: watch::Receiver<TurnState>,
    lease: Option<PooledConnection>,
    items: StreamState,
    failure: Option<String>,
}

impl Translator {
    async fn next(&mut self) -> Option<ChunkResult> {
        loop {
            let events = self.events.as_mut()?;
            let received = tokio::select! {
                biased;
                received = events.recv() => Some(received),
                _ = wait_for_interrupt(&mut self.state) => None,
            };
            let Some(received) = received else {
                tracing::debug!(
                    turn_id = %self.session.turn_id(),
                    "turn interrupted, closing stream"
                );
                return Some(self.finish(Ok(StreamChunk::Finished {
                    status: TurnStatus::Interrupted,
                })));
            };
            let event = received?;

            match event {
                InboundEvent::Notification(notification) => {
                    if !self.belongs_to_turn(&notification) {
                        continue;
                    }
                    if let Some(result) = self.translate(notification) {
                        return Some(result);
                    }
                }
                InboundEvent::ServerRequest { id, method, params } => {
                    if self.request_belongs_to_turn(params.as_ref()) {
                        return Some(Ok(StreamChunk::ServerRequest { id, method, params }));
                    }
                }
                InboundEvent::Malformed { error, raw } => {
                    if self.line_names_turn(&raw) {
                        tracing::warn!(
                            turn_id = %self.session.turn_id(),
                            error = %error,
                            "unreadable event for this turn"
                        );
                        return Some(self.finish(Err(ProviderError::Parse { message: error })));
                    }
                    tracing::debug!(
                        turn_id = %self.session.turn_id(),
                        error = %error,
                        "skipping malformed line"
                    );
                }
                InboundEvent::Closed { reason } => {
                    return Some(self.finish(Err(ProviderError::transport_closed(reason))));
                }
            }
        }
    }

    fn belongs_to_turn(&self, notification: &ServerNotification) -> bool {
        let connection_wide = matches!(notification, ServerNotification::Error(_));
        let thread_matches = notification
            .thread_id()
            .map_or(connection_wide, |thread_id| thread_id == self.session.thread_id());
        let turn_matches = notification
            .turn_id()
            .map_or(true, |turn_id| turn_id == self.session.turn_id());
        thread_matches && turn_matches
    }

    fn request_belongs_to_turn(&self, params: Option<&Value>) -> bool {
        let field = |name: &str| params.and_then(|params| params.get(name)).and_then(Value::as_str);
        field("threadId") == Some(self.session.thread_id())
            && field("turnId").map_or(true, |turn_id| turn_id == self.session.turn_id())
    }

    /// Whether a line that failed to decode still carries this turn's ids,
    /// flat or nested under `turn`.
    fn line_names_turn(&self, raw: &str) -> bool {
        let Ok(line) = serde_json::from_str::<Value>(raw) else {
            return false;
        };
        let Some(params) = line.get("params") else {
            return false;
        };
        let thread_id = params.get("threadId").and_then(Value::as_str);
        let turn_id = params
            .get("turnId")
            .or_else(|| params.get("turn").and_then(|turn| turn.get("id")))
            .and_then(Value::as_str);
        thread_id == Some(self.session.thread_id()) && turn_id == Some(self.session.turn_id())
    }

    fn translate(&mut self, notification: ServerNotification) -> Option<ChunkResult> {
        match notification {
            ServerNotification::TurnStarted(started) => Some(Ok(StreamChunk::TurnStarted {
                turn_id: started.turn_id,
            })),
            ServerNotification::ItemStarted(ItemNotification {
                item_id, item_type, ..
            }) => {
                if !self.items.open_item(&item_id, &item_type) {
                    tracing::debug!(item_id = %item_id, "item/started repeated for an open item");
                }
                Some(Ok(StreamChunk::ItemStarted { item_id, item_type }))
            }
            ServerNotification::ItemDelta(delta) => {
                self.items.record_delta();
                Some(Ok(StreamChunk::Delta {
                    item_id: delta.item_id,
                    kind: delta.kind.unwrap_or(DeltaKind::AgentMessage),
                    delta: delta.delta,
                }))
            }
            ServerNotification::ItemCompleted(ItemNotification {
                item_id, item_type, ..
            }) => {
                if !self.items.close_item(&item_id) {
                    tracing::debug!(item_id = %item_id, "item/completed without item/started");
                }
                Some(Ok(StreamChunk::ItemCompleted { item_id, item_type }))
            }
            ServerNotification::Error(error) => {
                if error.will_retry {
                    tracing::debug!(message = %error.error.message, "agent reported a retryable error");
                } else {
                    tracing::warn!(message = %error.error.message, "agent reported a turn error");
                    self.failure = Some(error.error.message);
                }
                None
            }
            ServerNotification::TurnCompleted(completed) => Some(self.complete(completed)),
            ServerNotification::Other { method, .. } => {
                tracing::trace!(method = %method, "ignoring notification");
                None
            }
        }
    }

    fn complete(&mut self, completed: TurnCompletedNotification) -> ChunkResult {
        if self.items.has_open_items() {
            tracing::warn!(
                turn_id = %completed.turn_id,
                open_items = ?self.items.open_items(),
                "turn completed with items still open"
            );
        }
        let outcome = match completed.status {
            TurnStatus::Completed | TurnStatus::Interrupted => Ok(StreamChunk::Finished {
                status: completed.status,
            }),
            status => {
                let message = completed
                    .error
                    .map(|error| error.message)
                    .or_else(|| self.failure.take())
                    .unwrap_or_else(|| format!("turn ended with status {status:?}"));
                Err(ProviderError::TurnFailed {
                    turn_id: completed.turn_id,
                    message,
                })
            }
        };
        tracing::debug!(
            turn_id = %self.session.turn_id(),
            deltas = self.items.delta_count(),
            success = outcome.is_ok(),
            "turn stream finished"
        );
        self.finish(outcome)
    }

    /// Ends the stream: the session leaves `Active`, then the lease goes back
    /// to the pool and the feed subscription is dropped before the final
    /// chunk reaches the caller.
    fn finish(&mut self, outcome: ChunkResult) -> ChunkResult {
        let state = match &outcome {
            Ok(StreamChunk::Finished { status }) => TurnState::for_status(*status),
            _ => TurnState::Failed,
        };
        self.session.end(state);
        self.events = None;
        self.lease = None;
        outcome
    }
}

impl Drop for Translator {
    fn drop(&mut self) {
        if self.lease.is_some() && self.session.end(TurnState::Detached) {
            tracing::debug!(
                turn_id = %self.session.turn_id(),
                "turn stream dropped before the turn ended"
            );
        }
    }
}

async fn wait_for_interrupt(state: &mut watch::Receiver<TurnState>) {
    loop {
        if *state.borrow_and_update() == TurnState::Interrupted {
            return;
        }
        if state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Chunks for one turn, ending with either `Finished` or exactly one error.
///
/// Events are buffered up to a bound; past it the connection stops reading
/// from the agent until the stream is polled again. Dropping the stream early
/// releases the connection and detaches the session, but leaves the turn
/// running on the agent; call [`Session::interrupt`] first to stop it.
pub struct TurnStream {
    session: Session,
    inner: BoxStream<'static, ChunkResult>,
}

impl fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnStream")
            .field("session", &self.session)
            .finish()
    }
}

impl TurnStream {
    /// `events` must be subscribed before `turn/start` was sent so nothing
    /// the agent emits for the turn is missed.
    pub(crate) fn new(session: Session, events: Subscription, lease: PooledConnection) -> Self {
        let translator = Translator {
            state: session.watch(),
            session: session.clone(),
            events: Some(events),
            lease: Some(lease),
            items: StreamState::default(),
            failure: None,
        };
        let inner = stream::unfold(translator, |mut translator| async move {
            let item = translator.next().await?;
            Some((item, translator))
        })
        .boxed();
        Self { session, inner }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drains the stream and concatenates agent message deltas.
    pub async fn collect_text(mut self) -> Result<String, ProviderError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            if let StreamChunk::Delta {
                kind: DeltaKind::AgentMessage,
                delta,
                ..
            } = chunk?
            {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}

impl Stream for TurnStream {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_state_tracks_open_items() {
        let mut state = StreamState::default();
        assert!(state.open_item("item-2", "agentMessage"));
        assert!(state.open_item("item-1", "reasoning"));
        assert!(!state.open_item("item-1", "reasoning"));
        assert_eq!(state.open_items(), vec!["item-1", "item-2"]);

        assert!(state.close_item("item-1"));
        assert!(!state.close_item("item-1"));
        assert!(state.has_open_items());
        assert!(state.close_item("item-2"));
        assert!(!state.has_open_items());
    }

    #[test]
    fn deltas_are_counted_without_opening_items() {
        let mut state = StreamState::default();
        state.record_delta();
        state.record_delta();
        assert_eq!(state.delta_count(), 2);
        assert!(!state.has_open_items());
    }
}
