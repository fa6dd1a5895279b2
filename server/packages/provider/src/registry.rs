use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use codex_provider_error::ProviderError;

use crate::pool::{ConnectionOptions, Pool, PoolSettings};
use crate::transport::TransportFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolFingerprint {
    settings: PoolSettings,
    options: ConnectionOptions,
    factory: usize,
}

impl PoolFingerprint {
    fn new(settings: PoolSettings, options: &ConnectionOptions, factory: &Arc<dyn TransportFactory>) -> Self {
        Self {
            settings,
            options: options.clone(),
            factory: Arc::as_ptr(factory) as *const () as usize,
        }
    }
}

struct RegisteredPool {
    pool: Pool,
    fingerprint: PoolFingerprint,
    owners: usize,
}

/// Global pools by key, reference counted by owning providers.
///
/// [`PoolRegistry::process_wide`] is the shared instance; tests build their
/// own with [`PoolRegistry::new`] so they can run in parallel.
#[derive(Clone, Default)]
pub struct PoolRegistry {
    pools: Arc<Mutex<HashMap<String, RegisteredPool>>>,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_wide() -> Self {
        static REGISTRY: OnceLock<PoolRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PoolRegistry::new).clone()
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, RegisteredPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the pool registered under `key`, creating it on first use.
    /// Every call that succeeds adds one owner and must be paired with
    /// [`PoolRegistry::release_pool`].
    pub fn acquire_pool(
        &self,
        key: &str,
        settings: PoolSettings,
        options: ConnectionOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Pool, ProviderError> {
        let fingerprint = PoolFingerprint::new(settings, &options, &factory);
        let mut pools = self.pools();

        if let Some(entry) = pools.get_mut(key) {
            if entry.fingerprint != fingerprint {
                tracing::warn!(
                    key = key,
                    existing = ?entry.fingerprint.settings,
                    requested = ?settings,
                    "global pool requested with different settings"
                );
                return Err(ProviderError::PoolConfigConflict {
                    key: key.to_string(),
                });
            }
            entry.owners += 1;
            tracing::debug!(key = key, owners = entry.owners, "joined global pool");
            return Ok(entry.pool.clone());
        }

        let pool = Pool::new(format!("global:{key}"), settings, options, factory);
        pools.insert(
            key.to_string(),
            RegisteredPool {
                pool: pool.clone(),
                fingerprint,
                owners: 1,
            },
        );
        tracing::info!(key = key, pool_size = settings.pool_size, "registered global pool");
        Ok(pool)
    }

    /// Drops one owner. The last owner deregisters the key and closes the pool.
    pub fn release_pool(&self, key: &str, pool: &Pool) {
        let removed = {
            let mut pools = self.pools();
            let Some(entry) = pools.get_mut(key) else {
                return;
            };
            if !entry.pool.ptr_eq(pool) {
                return;
            }
            entry.owners = entry.owners.saturating_sub(1);
            if entry.owners > 0 {
                tracing::debug!(key = key, owners = entry.owners, "left global pool");
                return;
            }
            pools.remove(key)
        };

        if let Some(entry) = removed {
            tracing::info!(key = key, "last owner left, closing global pool");
            entry.pool.close();
        }
    }

    pub fn owners(&self, key: &str) -> Option<usize> {
        self.pools().get(key).map(|entry| entry.owners)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pools().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pools().keys().cloned().collect();
        keys.sort();
        keys
    }
}
