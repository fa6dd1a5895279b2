//! In-process app-server double for tests and `--mock` runs.
//!
//! Every `connect` opens a fresh in-memory pipe served by its own task, the
//! way a real factory would spawn a fresh process. The server answers the
//! client methods with canned results and, after `turn/start`, pushes
//! `turn/started`, `item/started`, the scripted deltas, `item/completed` and
//! `turn/completed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use codex_provider_error::ProviderError;
use codex_provider_protocol::jsonrpc::{INVALID_PARAMS, METHOD_NOT_FOUND};
use codex_provider_protocol::{
    ClientRequest, DeltaKind, JsonRpcError, JsonRpcMessage, Model, ModelListParams, RequestId,
    ReasoningEffortOption, ServerNotification, TurnStatus,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use crate::transport::{ConnectFuture, TransportFactory, TransportIo};

const PIPE_CAPACITY: usize = 64 * 1024;
pub const APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";

#[derive(Debug, Clone)]
pub struct MockScript {
    pub deltas: Vec<String>,
    pub final_status: TurnStatus,
    pub error_message: Option<String>,
    /// Stop after the deltas and leave the turn running.
    pub hold_turn_open: bool,
    /// Emit `turn/completed` with status `interrupted` after `turn/interrupt`.
    pub complete_on_interrupt: bool,
    /// Drop the connection instead of answering `turn/start`.
    pub crash_on_turn_start: bool,
    /// Send an approval request before the first delta.
    pub approval_request: bool,
    /// Send `turn/completed` as `{threadId, turn: {id, status}}`.
    pub nested_completion: bool,
    /// Send `turn/completed` without a status.
    pub malformed_completion: bool,
    pub models: Vec<Model>,
    pub model_page_size: Option<usize>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            deltas: vec!["Hello from the mock agent.".to_string()],
            final_status: TurnStatus::Completed,
            error_message: None,
            hold_turn_open: false,
            complete_on_interrupt: false,
            crash_on_turn_start: false,
            approval_request: false,
            nested_completion: false,
            malformed_completion: false,
            models: vec![MockAppServer::default_model()],
            model_page_size: None,
        }
    }
}

impl MockScript {
    pub fn deltas<I, S>(mut self, deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deltas = deltas.into_iter().map(Into::into).collect();
        self
    }

    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.final_status = TurnStatus::Failed;
        self.error_message = Some(message.into());
        self
    }

    pub fn hold_turn_open(mut self) -> Self {
        self.hold_turn_open = true;
        self
    }

    pub fn complete_on_interrupt(mut self) -> Self {
        self.complete_on_interrupt = true;
        self
    }

    pub fn crash_on_turn_start(mut self) -> Self {
        self.crash_on_turn_start = true;
        self
    }

    pub fn approval_request(mut self) -> Self {
        self.approval_request = true;
        self
    }

    pub fn nested_completion(mut self) -> Self {
        self.nested_completion = true;
        self
    }

    pub fn malformed_completion(mut self) -> Self {
        self.malformed_completion = true;
        self
    }

    pub fn models(mut self, models: Vec<Model>, page_size: Option<usize>) -> Self {
        self.models = models;
        self.model_page_size = page_size;
        self
    }
}

/// One message the mock received. Responses to server requests are recorded
/// under the method `response`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    pub connection: u64,
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Default)]
struct MockState {
    received: Vec<RecordedMessage>,
    parse_errors: u64,
}

#[derive(Clone)]
pub struct MockAppServer {
    script: MockScript,
    connections: Arc<AtomicU64>,
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockAppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAppServer")
            .field("connections", &self.connection_count())
            .field("script", &self.script)
            .finish()
    }
}

impl Default for MockAppServer {
    fn default() -> Self {
        Self::new(MockScript::default())
    }
}

impl MockAppServer {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            connections: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn default_model() -> Model {
        Model {
            id: "gpt-5.1-codex".to_string(),
            model: "gpt-5.1-codex".to_string(),
            upgrade: None,
            display_name: "GPT-5.1 Codex".to_string(),
            description: "Optimized for agentic coding.".to_string(),
            hidden: false,
            supported_reasoning_efforts: vec![
                ReasoningEffortOption {
                    reasoning_effort: "low".to_string(),
                    description: "Fastest responses".to_string(),
                },
                ReasoningEffortOption {
                    reasoning_effort: "medium".to_string(),
                    description: "Balanced".to_string(),
                },
                ReasoningEffortOption {
                    reasoning_effort: "high".to_string(),
                    description: "Most thorough".to_string(),
                },
            ],
            default_reasoning_effort: Some("medium".to_string()),
            input_modalities: vec!["text".to_string(), "image".to_string()],
            supports_personality: false,
            is_default: true,
        }
    }

    pub fn script(&self) -> &MockScript {
        &self.script
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn received(&self) -> Vec<RecordedMessage> {
        self.state().received.clone()
    }

    pub fn requests(&self, method: &str) -> Vec<RecordedMessage> {
        self.state()
            .received
            .iter()
            .filter(|message| message.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state()
            .received
            .iter()
            .filter(|message| message.method == method)
            .count()
    }

    pub fn parse_errors(&self) -> u64 {
        self.state().parse_errors
    }
}

impl TransportFactory for MockAppServer {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let worker = MockConnection {
                connection,
                script: self.script.clone(),
                state: self.state.clone(),
                threads: 0,
                active_turn: None,
            };
            tokio::spawn(worker.serve(server));

            let (reader, writer) = tokio::io::split(client);
            Ok::<_, ProviderError>(TransportIo::new(format!("mock:{connection}"), reader, writer))
        })
    }

    fn describe(&self) -> String {
        "mock-app-server".to_string()
    }
}

struct ActiveTurn {
    thread_id: String,
    turn_id: String,
}

struct MockConnection {
    connection: u64,
    script: MockScript,
    state: Arc<Mutex<MockState>>,
    threads: u64,
    active_turn: Option<ActiveTurn>,
}

/// Why the serve loop stopped early.
enum Stop {
    Crash,
    ClientGone,
}

impl MockConnection {
    async fn serve(mut self, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(stop) = self.handle_line(&line, &mut writer).await {
                if let Stop::Crash = stop {
                    tracing::debug!(connection = self.connection, "mock app-server crashing");
                }
                return;
            }
        }
    }

    fn record(&self, id: Option<RequestId>, method: &str, params: Option<Value>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.received.push(RecordedMessage {
            connection: self.connection,
            id,
            method: method.to_string(),
            params,
        });
    }

    async fn handle_line(
        &mut self,
        line: &str,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> Result<(), Stop> {
        let message = match JsonRpcMessage::parse_line(line) {
            Ok(message) => message,
            Err(_) => {
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .parse_errors += 1;
                return write_message(writer, &JsonRpcMessage::parse_error_response()).await;
            }
        };

        match message {
            JsonRpcMessage::Notification { method, params } => {
                self.record(None, &method, params);
                Ok(())
            }
            JsonRpcMessage::Response { id, outcome } => {
                let params = match outcome {
                    Ok(result) => result,
                    Err(error) => json!({ "error": error }),
                };
                self.record(Some(id), "response", Some(params));
                Ok(())
            }
            JsonRpcMessage::Request { id, method, params } => {
                self.record(Some(id.clone()), &method, params.clone());
                self.handle_request(id, &method, params, writer).await
            }
        }
    }

    async fn handle_request(
        &mut self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> Result<(), Stop> {
        let request = match ClientRequest::from_parts(method, params) {
            Ok(Some(request)) => request,
            Ok(None) => {
                let error = JsonRpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}"));
                return respond(writer, id, Err(error)).await;
            }
            Err(err) => {
                let error = JsonRpcError::new(INVALID_PARAMS, format!("invalid params: {err}"));
                return respond(writer, id, Err(error)).await;
            }
        };

        match request {
            ClientRequest::Initialize(_) => {
                let result = json!({
                    "serverInfo": { "name": "mock-app-server", "version": "0.0.0" },
                    "userAgent": "mock-app-server/0.0.0"
                });
                respond(writer, id, Ok(result)).await
            }
            ClientRequest::ModelList(params) => {
                let result = self.model_page(&params);
                respond(writer, id, Ok(result)).await
            }
            ClientRequest::ThreadStart(_) => {
                self.threads += 1;
                let thread_id = format!("thread-{}-{}", self.connection, self.threads);
                respond(writer, id, Ok(json!({ "thread": { "id": thread_id } }))).await
            }
            ClientRequest::TurnStart(params) => {
                if self.script.crash_on_turn_start {
                    return Err(Stop::Crash);
                }
                let turn = ActiveTurn {
                    turn_id: format!("turn-{}", params.thread_id),
                    thread_id: params.thread_id,
                };
                let result = json!({ "turn": { "id": turn.turn_id, "status": "inProgress" } });
                respond(writer, id, Ok(result)).await?;
                self.run_turn(&turn, writer).await?;
                if self.script.hold_turn_open {
                    self.active_turn = Some(turn);
                }
                Ok(())
            }
            ClientRequest::TurnSteer(params) => match &self.active_turn {
                Some(turn)
                    if turn.thread_id == params.thread_id
                        && turn.turn_id == params.expected_turn_id =>
                {
                    let result = json!({ "turnId": turn.turn_id });
                    respond(writer, id, Ok(result)).await
                }
                _ => {
                    let error = JsonRpcError::new(INVALID_PARAMS, "no matching active turn");
                    respond(writer, id, Err(error)).await
                }
            },
            ClientRequest::TurnInterrupt(params) => {
                let turn = self.active_turn.take();
                respond(writer, id, Ok(json!({}))).await?;
                match turn {
                    Some(turn) if self.script.complete_on_interrupt && turn.turn_id == params.turn_id => {
                        let completed = json!({
                            "threadId": turn.thread_id,
                            "turnId": turn.turn_id,
                            "status": "interrupted"
                        });
                        notify(writer, ServerNotification::TURN_COMPLETED, completed).await
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn model_page(&self, params: &ModelListParams) -> Value {
        let start = params
            .cursor
            .as_deref()
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0)
            .min(self.script.models.len());
        let page_size = self
            .script
            .model_page_size
            .unwrap_or(self.script.models.len())
            .max(1);
        let end = (start + page_size).min(self.script.models.len());
        let next_cursor = (end < self.script.models.len()).then(|| end.to_string());
        json!({
            "data": &self.script.models[start..end],
            "nextCursor": next_cursor
        })
    }

    async fn run_turn(
        &self,
        turn: &ActiveTurn,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> Result<(), Stop> {
        let ids = json!({ "threadId": turn.thread_id, "turnId": turn.turn_id });
        let item_id = format!("item-{}", turn.turn_id);
        let item = json!({
            "threadId": turn.thread_id,
            "turnId": turn.turn_id,
            "itemId": item_id,
            "itemType": "agentMessage"
        });

        notify(writer, ServerNotification::TURN_STARTED, ids.clone()).await?;
        notify(writer, ServerNotification::ITEM_STARTED, item.clone()).await?;

        if self.script.approval_request {
            let request = JsonRpcMessage::Request {
                id: RequestId::from("approval-1"),
                method: APPROVAL_METHOD.to_string(),
                params: Some(json!({
                    "threadId": turn.thread_id,
                    "turnId": turn.turn_id,
                    "itemId": item_id,
                    "command": "cargo test"
                })),
            };
            write_message(writer, &request).await?;
        }

        for delta in &self.script.deltas {
            let params = json!({
                "threadId": turn.thread_id,
                "turnId": turn.turn_id,
                "itemId": item_id,
                "delta": delta
            });
            notify(writer, DeltaKind::AgentMessage.method(), params).await?;
        }

        if self.script.hold_turn_open {
            return Ok(());
        }

        notify(writer, ServerNotification::ITEM_COMPLETED, item).await?;

        let mut completed = json!({
            "threadId": turn.thread_id,
            "turnId": turn.turn_id,
            "status": self.script.final_status
        });
        if let Some(message) = &self.script.error_message {
            let error = json!({
                "error": { "message": message },
                "willRetry": false,
                "threadId": turn.thread_id,
                "turnId": turn.turn_id
            });
            notify(writer, ServerNotification::ERROR, error).await?;
            completed["error"] = json!({ "message": message });
        }
        if self.script.nested_completion {
            let mut nested = json!({ "id": turn.turn_id, "status": self.script.final_status });
            if let Some(error) = completed.get("error") {
                nested["error"] = error.clone();
            }
            completed = json!({ "threadId": turn.thread_id, "turn": nested });
        }
        if self.script.malformed_completion {
            if let Some(fields) = completed.as_object_mut() {
                fields.remove("status");
            }
        }
        notify(writer, ServerNotification::TURN_COMPLETED, completed).await
    }
}

async fn respond(
    writer: &mut WriteHalf<DuplexStream>,
    id: RequestId,
    outcome: Result<Value, JsonRpcError>,
) -> Result<(), Stop> {
    write_message(writer, &JsonRpcMessage::Response { id, outcome }).await
}

async fn notify(
    writer: &mut WriteHalf<DuplexStream>,
    method: &str,
    params: Value,
) -> Result<(), Stop> {
    let message = JsonRpcMessage::Notification {
        method: method.to_string(),
        params: Some(params),
    };
    write_message(writer, &message).await
}

async fn write_message(
    writer: &mut WriteHalf<DuplexStream>,
    message: &JsonRpcMessage,
) -> Result<(), Stop> {
    let mut line = message.to_line();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|_| Stop::ClientGone)?;
    writer.flush().await.map_err(|_| Stop::ClientGone)
}
