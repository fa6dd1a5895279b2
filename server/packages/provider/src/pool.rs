use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use codex_provider_error::ProviderError;
use codex_provider_protocol::ClientInfo;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::transport::TransportFactory;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

static POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Settings that decide whether two global registrations are compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub idle_timeout: Option<Duration>,
}

/// Applied to every connection a pool creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub client_info: ClientInfo,
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub closed: bool,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.idle + self.in_use
    }
}

struct IdleConnection {
    connection: Arc<Connection>,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    in_use: HashMap<u64, Arc<Connection>>,
    created: u64,
    closed: bool,
}

impl PoolState {
    fn evict_expired(&mut self, idle_timeout: Option<Duration>, now: Instant) -> Vec<Arc<Connection>> {
        let mut evicted = Vec::new();
        self.idle.retain(|entry| {
            let expired = idle_timeout
                .map(|limit| now.duration_since(entry.last_used) >= limit)
                .unwrap_or(false);
            if expired || entry.connection.is_closed() {
                evicted.push(entry.connection.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    fn drain(&mut self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.idle.drain(..).map(|entry| entry.connection).collect();
        all.extend(self.in_use.drain().map(|(_, connection)| connection));
        all
    }
}

struct PoolInner {
    id: u64,
    label: String,
    settings: PoolSettings,
    options: ConnectionOptions,
    factory: Arc<dyn TransportFactory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(&self) {
        let evicted = self
            .state()
            .evict_expired(self.settings.idle_timeout, Instant::now());
        self.close_evicted(evicted);
    }

    fn close_evicted(&self, evicted: Vec<Arc<Connection>>) {
        for connection in evicted {
            tracing::debug!(
                pool = %self.label,
                connection_id = connection.id(),
                already_closed = connection.is_closed(),
                "evicting idle connection"
            );
            connection.close();
        }
    }

    fn check_in(&self, connection: Arc<Connection>) {
        let mut state = self.state();
        state.in_use.remove(&connection.id());
        if state.closed || connection.is_closed() {
            drop(state);
            tracing::debug!(
                pool = %self.label,
                connection_id = connection.id(),
                "released connection is not reusable, closing"
            );
            connection.close();
            return;
        }
        state.idle.push_back(IdleConnection {
            connection,
            last_used: Instant::now(),
        });
    }

    fn stop_sweeper(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.stop_sweeper();
        for connection in self.state().drain() {
            connection.close();
        }
    }
}

/// A bounded set of connections created lazily through one transport
/// factory. Cloning shares the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Starts the idle sweeper when an idle timeout is set and a tokio runtime
    /// is available; otherwise expired connections are only reaped on acquire.
    pub fn new(
        label: impl Into<String>,
        settings: PoolSettings,
        options: ConnectionOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            id: POOL_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            settings,
            options,
            factory,
            permits: Arc::new(Semaphore::new(settings.pool_size)),
            state: Mutex::new(PoolState::default()),
            sweeper: Mutex::new(None),
        });

        if let Some(idle_timeout) = settings.idle_timeout {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let task = handle.spawn(sweep_idle(Arc::downgrade(&inner), idle_timeout));
                *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
        }

        tracing::debug!(
            pool = %inner.label,
            pool_size = settings.pool_size,
            idle_timeout_ms = settings.idle_timeout.map(|timeout| timeout.as_millis() as u64),
            factory = %inner.factory.describe(),
            "pool created"
        );
        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            created: state.created,
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Hands out the most recently used live idle connection, or creates and
    /// initializes a new one. Waits while `pool_size` connections are leased.
    pub async fn acquire(&self) -> Result<PooledConnection, ProviderError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::PoolClosed)?;

        let (reused, evicted) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(ProviderError::PoolClosed);
            }
            let evicted = state.evict_expired(self.inner.settings.idle_timeout, Instant::now());
            let reused = state.idle.pop_back().map(|entry| entry.connection);
            if let Some(connection) = &reused {
                state.in_use.insert(connection.id(), connection.clone());
            }
            (reused, evicted)
        };
        self.inner.close_evicted(evicted);

        let connection = match reused {
            Some(connection) => {
                tracing::debug!(
                    pool = %self.inner.label,
                    connection_id = connection.id(),
                    "reusing pooled connection"
                );
                connection
            }
            None => self.create().await?,
        };

        Ok(PooledConnection {
            connection,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    async fn create(&self) -> Result<Arc<Connection>, ProviderError> {
        let io = self.inner.factory.connect().await?;
        let connection = Arc::new(Connection::new(io, self.inner.options.request_timeout));

        if let Err(err) = connection.initialize(&self.inner.options.client_info).await {
            tracing::warn!(
                pool = %self.inner.label,
                connection_id = connection.id(),
                error = %err,
                "new connection failed to initialize"
            );
            connection.close();
            return Err(err);
        }

        let mut state = self.inner.state();
        if state.closed {
            drop(state);
            connection.close();
            return Err(ProviderError::PoolClosed);
        }
        state.created += 1;
        state.in_use.insert(connection.id(), connection.clone());
        tracing::info!(
            pool = %self.inner.label,
            connection_id = connection.id(),
            created = state.created,
            "pool connection created"
        );
        Ok(connection)
    }

    /// Closes every member connection, leased or idle, and fails pending and
    /// future acquires with `PoolClosed`.
    pub fn close(&self) {
        let connections = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain()
        };
        self.inner.permits.close();
        self.inner.stop_sweeper();
        tracing::info!(
            pool = %self.inner.label,
            closed_connections = connections.len(),
            "pool shut down"
        );
        for connection in connections {
            connection.close();
        }
    }
}

async fn sweep_idle(pool: Weak<PoolInner>, idle_timeout: Duration) {
    let period = (idle_timeout / 2).max(MIN_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.state().closed {
            break;
        }
        pool.reap();
    }
}

/// A leased connection. Dropping the lease returns the connection to its pool.
pub struct PooledConnection {
    connection: Arc<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.label)
            .field("connection", &self.connection)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.check_in(self.connection.clone());
    }
}
