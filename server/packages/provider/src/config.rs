use std::path::Path;
use std::time::Duration;

use codex_provider_error::ProviderError;
use codex_provider_protocol::ClientInfo;
use serde::{Deserialize, Serialize};

use crate::pool::{ConnectionOptions, PoolSettings};

pub const DEFAULT_POOL_SIZE: usize = 1;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

pub const POOL_SIZE_ENV: &str = "CODEX_PROVIDER_POOL_SIZE";
pub const IDLE_TIMEOUT_ENV: &str = "CODEX_PROVIDER_IDLE_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "CODEX_PROVIDER_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolScope {
    #[default]
    Private,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default)]
    pub scope: PoolScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::private(DEFAULT_POOL_SIZE)
    }
}

impl PoolConfig {
    pub fn private(pool_size: usize) -> Self {
        Self {
            scope: PoolScope::Private,
            key: None,
            pool_size,
            idle_timeout_ms: None,
        }
    }

    pub fn global(key: impl Into<String>, pool_size: usize) -> Self {
        Self {
            scope: PoolScope::Global,
            key: Some(key.into()),
            pool_size,
            idle_timeout_ms: None,
        }
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = Some(idle_timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.pool_size == 0 {
            return Err(invalid("poolSize must be at least 1"));
        }
        if self.scope == PoolScope::Global && self.global_key().is_none() {
            return Err(invalid("a global pool requires a non-empty key"));
        }
        Ok(())
    }

    /// The registry key, only for global scope.
    pub fn global_key(&self) -> Option<&str> {
        match self.scope {
            PoolScope::Global => self.key.as_deref().filter(|key| !key.trim().is_empty()),
            PoolScope::Private => None,
        }
    }

    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            pool_size: self.pool_size,
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_client_info")]
    pub client_info: ClientInfo,
    /// `0` disables the per-request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

pub fn default_client_info() -> ClientInfo {
    ClientInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        title: Some("Codex Provider".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            client_info: default_client_info(),
            request_timeout_ms: None,
        }
    }
}

impl ProviderConfig {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProviderError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| invalid(format!("invalid provider config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| invalid(format!("failed to read {}: {err}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        self.pool.validate()
    }

    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Invalid or zero values leave the configured value in place.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(pool_size) = positive_from(lookup(POOL_SIZE_ENV)) {
            self.pool.pool_size = pool_size as usize;
        }
        if let Some(idle_timeout) = positive_from(lookup(IDLE_TIMEOUT_ENV)) {
            self.pool.idle_timeout_ms = Some(idle_timeout);
        }
        if let Some(request_timeout) = positive_from(lookup(REQUEST_TIMEOUT_ENV)) {
            self.request_timeout_ms = Some(request_timeout);
        }
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            client_info: self.client_info.clone(),
            request_timeout: self.request_timeout(),
        }
    }
}

fn positive_from(raw: Option<String>) -> Option<u64> {
    raw?.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

fn invalid(message: impl Into<String>) -> ProviderError {
    ProviderError::InvalidConfig {
        message: message.into(),
    }
}
