use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json-rpc message must be an object")]
    NotAnObject,
    #[error("json-rpc method must be a string")]
    InvalidMethod,
    #[error("json-rpc id must be an integer or a string")]
    InvalidId,
    #[error("json-rpc error object is malformed: {0}")]
    InvalidError(serde_json::Error),
    #[error("message has neither a method nor a result/error")]
    Unclassifiable,
}

/// One line of the protocol, classified by which envelope fields are present.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, JsonRpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut object) = value else {
            return Err(ParseError::NotAnObject);
        };

        let id = match object.remove("id") {
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw).map_err(|_| ParseError::InvalidId)?,
            ),
            None => None,
        };
        let params = object.remove("params");

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(ParseError::InvalidMethod);
            };
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(ParseError::Unclassifiable);
        };

        if let Some(error) = object.remove("error") {
            let error =
                serde_json::from_value::<JsonRpcError>(error).map_err(ParseError::InvalidError)?;
            return Ok(Self::Response {
                id,
                outcome: Err(error),
            });
        }

        match object.remove("result") {
            Some(result) => Ok(Self::Response {
                id,
                outcome: Ok(result),
            }),
            None => Err(ParseError::Unclassifiable),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Self::Request { id, method, params } => {
                object.insert("id".to_string(), request_id_value(id));
                object.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                object.insert("id".to_string(), request_id_value(id));
                match outcome {
                    Ok(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        let mut error_object = Map::new();
                        error_object.insert("code".to_string(), Value::from(error.code));
                        error_object
                            .insert("message".to_string(), Value::String(error.message.clone()));
                        if let Some(data) = &error.data {
                            error_object.insert("data".to_string(), data.clone());
                        }
                        object.insert("error".to_string(), Value::Object(error_object));
                    }
                }
            }
            Self::Notification { method, params } => {
                object.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(object)
    }

    /// Serialized form without the trailing line break. `Value` display never
    /// emits raw newlines, so the result is always a single line.
    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }

    /// Reply sent by a receiver that is obliged to answer a line it could not
    /// parse. The id is unknown, so `-1` stands in for it.
    pub fn parse_error_response() -> Self {
        Self::Response {
            id: RequestId::Integer(-1),
            outcome: Err(JsonRpcError::new(PARSE_ERROR, "parse error")),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

fn request_id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Integer(value) => Value::from(*value),
        RequestId::String(value) => Value::String(value.clone()),
    }
}
