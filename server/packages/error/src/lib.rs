use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    TransportClosed,
    Rpc,
    PoolConfigConflict,
    PoolClosed,
    SessionInactive,
    Parse,
    InvalidConfig,
    Spawn,
    Timeout,
    TurnFailed,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportClosed => "transport_closed",
            Self::Rpc => "rpc",
            Self::PoolConfigConflict => "pool_config_conflict",
            Self::PoolClosed => "pool_closed",
            Self::SessionInactive => "session_inactive",
            Self::Parse => "parse",
            Self::InvalidConfig => "invalid_config",
            Self::Spawn => "spawn",
            Self::Timeout => "timeout",
            Self::TurnFailed => "turn_failed",
        }
    }

    pub fn as_urn(&self) -> String {
        format!("urn:codex-provider:error:{}", self.as_str())
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::TransportClosed => "Transport Closed",
            Self::Rpc => "RPC Error",
            Self::PoolConfigConflict => "Pool Configuration Conflict",
            Self::PoolClosed => "Pool Closed",
            Self::SessionInactive => "Session Inactive",
            Self::Parse => "Parse Error",
            Self::InvalidConfig => "Invalid Configuration",
            Self::Spawn => "Spawn Failed",
            Self::Timeout => "Timeout",
            Self::TurnFailed => "Turn Failed",
        }
    }

    /// Whether the failure takes down every pending call on the connection, as
    /// opposed to only the call or turn that observed it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::TransportClosed | Self::Spawn)
    }
}

/// JSON-RPC error object reported by the agent for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub urn: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transport closed: {reason}")]
    TransportClosed { reason: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("pool '{key}' already exists with different settings")]
    PoolConfigConflict { key: String },
    #[error("pool is shut down")]
    PoolClosed,
    #[error("session {thread_id}/{turn_id} is not active")]
    SessionInactive { thread_id: String, turn_id: String },
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("timed out waiting for `{method}` response")]
    Timeout { method: String },
    #[error("turn {turn_id} failed: {message}")]
    TurnFailed { turn_id: String, message: String },
}

impl ProviderError {
    pub fn transport_closed(reason: impl Into<String>) -> Self {
        Self::TransportClosed {
            reason: reason.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::TransportClosed { .. } => ErrorType::TransportClosed,
            Self::Rpc(_) => ErrorType::Rpc,
            Self::PoolConfigConflict { .. } => ErrorType::PoolConfigConflict,
            Self::PoolClosed => ErrorType::PoolClosed,
            Self::SessionInactive { .. } => ErrorType::SessionInactive,
            Self::Parse { .. } => ErrorType::Parse,
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
            Self::Spawn { .. } => ErrorType::Spawn,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::TurnFailed { .. } => ErrorType::TurnFailed,
        }
    }

    pub fn to_error_details(&self) -> ErrorDetails {
        let details = match self {
            Self::TransportClosed { reason } => Some(single("reason", Value::String(reason.clone()))),
            Self::Rpc(error) => {
                let mut map = Map::new();
                map.insert("code".to_string(), Value::from(error.code));
                if let Some(data) = &error.data {
                    map.insert("data".to_string(), data.clone());
                }
                Some(Value::Object(map))
            }
            Self::PoolConfigConflict { key } => Some(single("key", Value::String(key.clone()))),
            Self::PoolClosed => None,
            Self::SessionInactive { thread_id, turn_id } => {
                let mut map = Map::new();
                map.insert("threadId".to_string(), Value::String(thread_id.clone()));
                map.insert("turnId".to_string(), Value::String(turn_id.clone()));
                Some(Value::Object(map))
            }
            Self::Parse { .. } | Self::InvalidConfig { .. } => None,
            Self::Spawn { command, .. } => Some(single("command", Value::String(command.clone()))),
            Self::Timeout { method } => Some(single("method", Value::String(method.clone()))),
            Self::TurnFailed { turn_id, .. } => {
                Some(single("turnId", Value::String(turn_id.clone())))
            }
        };

        let error_type = self.error_type();
        ErrorDetails {
            type_: error_type,
            urn: error_type.as_urn(),
            title: error_type.title().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl From<ProviderError> for ErrorDetails {
    fn from(value: ProviderError) -> Self {
        value.to_error_details()
    }
}

impl From<&ProviderError> for ErrorDetails {
    fn from(value: &ProviderError) -> Self {
        value.to_error_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_error_details_keep_code_and_data() {
        let error = ProviderError::from(RpcError {
            code: -32602,
            message: "invalid params".to_string(),
            data: Some(json!({ "field": "threadId" })),
        });

        let details = error.to_error_details();
        assert_eq!(details.type_, ErrorType::Rpc);
        assert_eq!(details.urn, "urn:codex-provider:error:rpc");
        assert_eq!(details.message, "rpc error -32602: invalid params");
        assert_eq!(
            details.details,
            Some(json!({ "code": -32602, "data": { "field": "threadId" } }))
        );
    }

    #[test]
    fn only_transport_level_failures_are_connection_fatal() {
        assert!(ProviderError::transport_closed("eof")
            .error_type()
            .is_connection_fatal());
        assert!(!ProviderError::PoolConfigConflict {
            key: "shared".to_string()
        }
        .error_type()
        .is_connection_fatal());
        assert!(!ProviderError::SessionInactive {
            thread_id: "t".to_string(),
            turn_id: "u".to_string(),
        }
        .error_type()
        .is_connection_fatal());
    }

    #[test]
    fn error_type_serializes_snake_case() {
        let value = serde_json::to_value(ErrorType::PoolConfigConflict).expect("serialize");
        assert_eq!(value, json!("pool_config_conflict"));
        assert_eq!(ErrorType::PoolConfigConflict.as_str(), "pool_config_conflict");
    }
}
