use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use codex_provider_error::ProviderError;
use codex_provider_protocol::{
    Model, ModelListParams, ThreadStartParams, TurnStartParams, UserInput,
};

use crate::config::ProviderConfig;
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::session::{Session, SessionTracker};
use crate::stream::TurnStream;
use crate::transport::TransportFactory;

pub type SessionHook = Box<dyn FnOnce(Session) + Send>;

/// Input for one turn.
#[derive(Default)]
pub struct TurnRequest {
    pub input: Vec<UserInput>,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub cwd: Option<String>,
    pub on_session_created: Option<SessionHook>,
}

impl fmt::Debug for TurnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnRequest")
            .field("input", &self.input)
            .field("model", &self.model)
            .field("effort", &self.effort)
            .field("cwd", &self.cwd)
            .field("on_session_created", &self.on_session_created.is_some())
            .finish()
    }
}

impl TurnRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            input: vec![UserInput::text(prompt)],
            ..Self::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn effort(mut self, effort: impl Into<String>) -> Self {
        self.effort = Some(effort.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Called once with the session after `turn/start` succeeded and the
    /// session is active, before the stream is returned.
    pub fn on_session_created(mut self, hook: impl FnOnce(Session) + Send + 'static) -> Self {
        self.on_session_created = Some(Box::new(hook));
        self
    }
}

/// Streaming model provider backed by pooled app-server connections.
pub struct AppServerProvider {
    config: ProviderConfig,
    registry: PoolRegistry,
    pool: Pool,
    shut_down: AtomicBool,
}

impl fmt::Debug for AppServerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppServerProvider")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl AppServerProvider {
    /// Global pools are looked up in [`PoolRegistry::process_wide`].
    pub fn new(
        config: ProviderConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ProviderError> {
        Self::with_registry(config, factory, PoolRegistry::process_wide())
    }

    pub fn with_registry(
        config: ProviderConfig,
        factory: Arc<dyn TransportFactory>,
        registry: PoolRegistry,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let settings = config.pool.settings();
        let options = config.connection_options();

        let pool = match config.pool.global_key() {
            Some(key) => registry.acquire_pool(key, settings, options, factory)?,
            None => Pool::new("private", settings, options, factory),
        };

        Ok(Self {
            config,
            registry,
            pool,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ProviderError> {
        if self.is_shut_down() {
            Err(ProviderError::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// The full catalog in server order, following `nextCursor` pages.
    pub async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        self.ensure_running()?;
        let connection = self.pool.acquire().await?;
        connection.initialize(&self.config.client_info).await?;

        let mut models = Vec::new();
        let mut cursor = None;
        loop {
            let page = connection
                .list_models(ModelListParams {
                    cursor: cursor.take(),
                    limit: None,
                })
                .await?;
            models.extend(page.data);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!(models = models.len(), "listed models");
        Ok(models)
    }

    /// Starts a thread and a turn on a pooled connection and returns the
    /// turn's chunk stream. The connection stays leased until the stream ends
    /// or is dropped.
    pub async fn stream(&self, request: TurnRequest) -> Result<TurnStream, ProviderError> {
        self.ensure_running()?;
        let TurnRequest {
            input,
            model,
            effort,
            cwd,
            on_session_created,
        } = request;

        let lease = self.pool.acquire().await?;
        lease.initialize(&self.config.client_info).await?;

        let thread_id = lease
            .thread_start(ThreadStartParams {
                model: model.clone(),
                cwd: cwd.clone(),
                ..ThreadStartParams::default()
            })
            .await?;

        // Subscribe before `turn/start` so early notifications are buffered.
        let tracker = SessionTracker::default();
        let events = lease.subscribe_with(tracker.hook());
        let turn_id = lease
            .turn_start(TurnStartParams {
                thread_id: thread_id.clone(),
                input,
                model,
                effort,
                cwd,
            })
            .await?;

        let session = Session::new(thread_id, turn_id, lease.connection());
        session.activate();
        tracing::info!(
            pool = %self.pool.label(),
            connection_id = lease.id(),
            thread_id = %session.thread_id(),
            turn_id = %session.turn_id(),
            "turn started"
        );

        if let Some(hook) = on_session_created {
            hook(session.clone());
        }
        tracker.attach(&session);

        Ok(TurnStream::new(session, events, lease))
    }

    /// Private pools are closed. Global pools lose one owner and close with
    /// the last one. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.config.pool.global_key() {
            Some(key) => self.registry.release_pool(key, &self.pool),
            None => self.pool.close(),
        }
        tracing::debug!(pool = %self.pool.label(), "provider shut down");
    }
}

impl Drop for AppServerProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
