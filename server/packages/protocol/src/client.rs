use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Model;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelListResponse {
    pub data: Vec<Model>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub id: String,
}

/// Older servers answer `{threadId}`, newer ones `{thread: {id, ..}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRef>,
}

impl ThreadStartResponse {
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id
            .as_deref()
            .or_else(|| self.thread.as_ref().map(|thread| thread.id.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextElement {
    pub byte_range: ByteRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UserInput {
    Text {
        text: String,
        #[serde(default)]
        text_elements: Vec<TextElement>,
    },
    Image {
        url: String,
    },
    LocalImage {
        path: String,
    },
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            text_elements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartParams {
    pub thread_id: String,
    pub input: Vec<UserInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRef {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnRef>,
}

impl TurnStartResponse {
    pub fn turn_id(&self) -> Option<&str> {
        self.turn_id
            .as_deref()
            .or_else(|| self.turn.as_ref().map(|turn| turn.id.as_str()))
    }
}

/// `expected_turn_id` lets the agent reject a steer aimed at a turn that has
/// already moved on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSteerParams {
    pub thread_id: String,
    pub expected_turn_id: String,
    pub input: Vec<UserInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSteerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInterruptParams {
    pub thread_id: String,
    pub turn_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeParams),
    ModelList(ModelListParams),
    ThreadStart(ThreadStartParams),
    TurnStart(TurnStartParams),
    TurnSteer(TurnSteerParams),
    TurnInterrupt(TurnInterruptParams),
}

impl ClientRequest {
    pub const INITIALIZE: &'static str = "initialize";
    pub const MODEL_LIST: &'static str = "model/list";
    pub const THREAD_START: &'static str = "thread/start";
    pub const TURN_START: &'static str = "turn/start";
    pub const TURN_STEER: &'static str = "turn/steer";
    pub const TURN_INTERRUPT: &'static str = "turn/interrupt";

    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize(_) => Self::INITIALIZE,
            Self::ModelList(_) => Self::MODEL_LIST,
            Self::ThreadStart(_) => Self::THREAD_START,
            Self::TurnStart(_) => Self::TURN_START,
            Self::TurnSteer(_) => Self::TURN_STEER,
            Self::TurnInterrupt(_) => Self::TURN_INTERRUPT,
        }
    }

    pub fn params(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Initialize(params) => serde_json::to_value(params),
            Self::ModelList(params) => serde_json::to_value(params),
            Self::ThreadStart(params) => serde_json::to_value(params),
            Self::TurnStart(params) => serde_json::to_value(params),
            Self::TurnSteer(params) => serde_json::to_value(params),
            Self::TurnInterrupt(params) => serde_json::to_value(params),
        }
    }

    /// Decode an inbound request. `Ok(None)` means the method is not part of
    /// the protocol; a known method with bad params is an error.
    pub fn from_parts(
        method: &str,
        params: Option<Value>,
    ) -> Result<Option<Self>, serde_json::Error> {
        let params = params.unwrap_or_else(|| Value::Object(Default::default()));
        let request = match method {
            Self::INITIALIZE => Self::Initialize(serde_json::from_value(params)?),
            Self::MODEL_LIST => Self::ModelList(serde_json::from_value(params)?),
            Self::THREAD_START => Self::ThreadStart(serde_json::from_value(params)?),
            Self::TURN_START => Self::TurnStart(serde_json::from_value(params)?),
            Self::TURN_STEER => Self::TurnSteer(serde_json::from_value(params)?),
            Self::TURN_INTERRUPT => Self::TurnInterrupt(serde_json::from_value(params)?),
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}
