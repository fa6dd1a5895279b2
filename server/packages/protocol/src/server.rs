use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartedNotification {
    pub thread_id: String,
    pub turn_id: String,
}

/// Payload shared by `item/started` and `item/completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemNotification {
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    #[serde(default)]
    pub item_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeltaKind {
    AgentMessage,
    Reasoning,
    ReasoningSummary,
    CommandOutput,
    FileChange,
}

impl DeltaKind {
    pub const ALL: [DeltaKind; 5] = [
        Self::AgentMessage,
        Self::Reasoning,
        Self::ReasoningSummary,
        Self::CommandOutput,
        Self::FileChange,
    ];

    pub fn method(&self) -> &'static str {
        match self {
            Self::AgentMessage => "item/agentMessage/delta",
            Self::Reasoning => "item/reasoning/textDelta",
            Self::ReasoningSummary => "item/reasoning/summaryTextDelta",
            Self::CommandOutput => "item/commandExecution/outputDelta",
            Self::FileChange => "item/fileChange/outputDelta",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.method() == method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDeltaNotification {
    #[serde(skip)]
    pub kind: Option<DeltaKind>,
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Failed,
    InProgress,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub message: String,
}

/// Accepts both the flat `{threadId, turnId, status}` payload and the nested
/// `{threadId, turn: {id, status, error}}` one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "TurnCompletedPayload")]
pub struct TurnCompletedNotification {
    pub thread_id: String,
    pub turn_id: String,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
}

#[derive(Deserialize)]
struct CompletedTurn {
    id: String,
    #[serde(default)]
    status: Option<TurnStatus>,
    #[serde(default)]
    error: Option<TurnError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnCompletedPayload {
    thread_id: String,
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    status: Option<TurnStatus>,
    #[serde(default)]
    error: Option<TurnError>,
    #[serde(default)]
    turn: Option<CompletedTurn>,
}

impl TryFrom<TurnCompletedPayload> for TurnCompletedNotification {
    type Error = String;

    fn try_from(payload: TurnCompletedPayload) -> Result<Self, Self::Error> {
        let (nested_id, nested_status, nested_error) = match payload.turn {
            Some(turn) => (Some(turn.id), turn.status, turn.error),
            None => (None, None, None),
        };
        let turn_id = payload
            .turn_id
            .or(nested_id)
            .ok_or_else(|| "missing field `turnId`".to_string())?;
        let status = payload
            .status
            .or(nested_status)
            .ok_or_else(|| "missing field `status`".to_string())?;
        Ok(Self {
            thread_id: payload.thread_id,
            turn_id,
            status,
            error: payload.error.or(nested_error),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotification {
    pub error: TurnError,
    #[serde(default)]
    pub will_retry: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    TurnStarted(TurnStartedNotification),
    ItemStarted(ItemNotification),
    ItemDelta(ItemDeltaNotification),
    ItemCompleted(ItemNotification),
    TurnCompleted(TurnCompletedNotification),
    Error(ErrorNotification),
    Other { method: String, params: Option<Value> },
}

impl ServerNotification {
    pub const TURN_STARTED: &'static str = "turn/started";
    pub const ITEM_STARTED: &'static str = "item/started";
    pub const ITEM_COMPLETED: &'static str = "item/completed";
    pub const TURN_COMPLETED: &'static str = "turn/completed";
    pub const ERROR: &'static str = "error";

    /// Decode a notification by method. Unknown methods pass through as
    /// `Other`; a known method whose params do not match its shape is an error.
    pub fn from_parts(method: &str, params: Option<Value>) -> Result<Self, serde_json::Error> {
        let payload = |params: Option<Value>| params.unwrap_or(Value::Null);
        let notification = match method {
            Self::TURN_STARTED => Self::TurnStarted(serde_json::from_value(payload(params))?),
            Self::ITEM_STARTED => Self::ItemStarted(serde_json::from_value(payload(params))?),
            Self::ITEM_COMPLETED => Self::ItemCompleted(serde_json::from_value(payload(params))?),
            Self::TURN_COMPLETED => Self::TurnCompleted(serde_json::from_value(payload(params))?),
            Self::ERROR => Self::Error(serde_json::from_value(payload(params))?),
            other => match DeltaKind::from_method(other) {
                Some(kind) => {
                    let mut delta: ItemDeltaNotification =
                        serde_json::from_value(payload(params))?;
                    delta.kind = Some(kind);
                    Self::ItemDelta(delta)
                }
                None => Self::Other {
                    method: other.to_string(),
                    params,
                },
            },
        };
        Ok(notification)
    }

    pub fn method(&self) -> &str {
        match self {
            Self::TurnStarted(_) => Self::TURN_STARTED,
            Self::ItemStarted(_) => Self::ITEM_STARTED,
            Self::ItemDelta(delta) => delta
                .kind
                .map(|kind| kind.method())
                .unwrap_or(DeltaKind::AgentMessage.method()),
            Self::ItemCompleted(_) => Self::ITEM_COMPLETED,
            Self::TurnCompleted(_) => Self::TURN_COMPLETED,
            Self::Error(_) => Self::ERROR,
            Self::Other { method, .. } => method,
        }
    }

    pub fn params(&self) -> Option<Value> {
        match self {
            Self::TurnStarted(params) => serde_json::to_value(params).ok(),
            Self::ItemStarted(params) | Self::ItemCompleted(params) => {
                serde_json::to_value(params).ok()
            }
            Self::ItemDelta(params) => serde_json::to_value(params).ok(),
            Self::TurnCompleted(params) => serde_json::to_value(params).ok(),
            Self::Error(params) => serde_json::to_value(params).ok(),
            Self::Other { params, .. } => params.clone(),
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::TurnStarted(params) => Some(&params.thread_id),
            Self::ItemStarted(params) | Self::ItemCompleted(params) => Some(&params.thread_id),
            Self::ItemDelta(params) => Some(&params.thread_id),
            Self::TurnCompleted(params) => Some(&params.thread_id),
            Self::Error(params) => params.thread_id.as_deref(),
            Self::Other { params, .. } => params
                .as_ref()
                .and_then(|params| params.get("threadId"))
                .and_then(Value::as_str),
        }
    }

    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::TurnStarted(params) => Some(&params.turn_id),
            Self::ItemStarted(params) | Self::ItemCompleted(params) => Some(&params.turn_id),
            Self::ItemDelta(params) => Some(&params.turn_id),
            Self::TurnCompleted(params) => Some(&params.turn_id),
            Self::Error(params) => params.turn_id.as_deref(),
            Self::Other { params, .. } => params
                .as_ref()
                .and_then(|params| params.get("turnId"))
                .and_then(Value::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_methods_decode_with_their_kind() {
        let notification = ServerNotification::from_parts(
            "item/reasoning/summaryTextDelta",
            Some(json!({
                "threadId": "thread-1",
                "turnId": "turn-1",
                "itemId": "item-1",
                "delta": "thinking"
            })),
        )
        .expect("decode");

        let ServerNotification::ItemDelta(delta) = &notification else {
            panic!("expected delta, got {notification:?}");
        };
        assert_eq!(delta.kind, Some(DeltaKind::ReasoningSummary));
        assert_eq!(delta.delta, "thinking");
        assert_eq!(notification.method(), "item/reasoning/summaryTextDelta");
        assert_eq!(notification.thread_id(), Some("thread-1"));
    }

    #[test]
    fn unknown_statuses_and_methods_are_tolerated() {
        let completed = ServerNotification::from_parts(
            "turn/completed",
            Some(json!({ "threadId": "t", "turnId": "u", "status": "paused" })),
        )
        .expect("decode");
        assert!(matches!(
            completed,
            ServerNotification::TurnCompleted(TurnCompletedNotification {
                status: TurnStatus::Unknown,
                ..
            })
        ));

        let other = ServerNotification::from_parts(
            "thread/tokenUsage/updated",
            Some(json!({ "threadId": "t", "turnId": "u" })),
        )
        .expect("decode");
        assert_eq!(other.method(), "thread/tokenUsage/updated");
        assert_eq!(other.thread_id(), Some("t"));
        assert_eq!(other.turn_id(), Some("u"));
    }

    #[test]
    fn known_method_with_bad_params_is_rejected() {
        assert!(
            ServerNotification::from_parts("item/started", Some(json!({ "threadId": 5 }))).is_err()
        );
        assert!(ServerNotification::from_parts("turn/completed", None).is_err());
    }

    #[test]
    fn in_progress_status_uses_camel_case() {
        let status: TurnStatus = serde_json::from_value(json!("inProgress")).expect("status");
        assert_eq!(status, TurnStatus::InProgress);
    }

    #[test]
    fn turn_completed_accepts_the_nested_turn_shape() {
        let notification = ServerNotification::from_parts(
            "turn/completed",
            Some(json!({
                "threadId": "t",
                "turn": { "id": "u", "status": "failed", "error": { "message": "quota" } }
            })),
        )
        .expect("decode");

        let ServerNotification::TurnCompleted(completed) = notification else {
            panic!("expected turn/completed");
        };
        assert_eq!(completed.turn_id, "u");
        assert_eq!(completed.status, TurnStatus::Failed);
        assert_eq!(completed.error.map(|error| error.message), Some("quota".to_string()));
    }

    #[test]
    fn turn_completed_without_a_status_is_rejected() {
        assert!(ServerNotification::from_parts(
            "turn/completed",
            Some(json!({ "threadId": "t", "turnId": "u" })),
        )
        .is_err());
    }
}
