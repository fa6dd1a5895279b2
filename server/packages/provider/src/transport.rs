use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use codex_provider_error::{ProviderError, RpcError};
use codex_provider_protocol::{JsonRpcError, JsonRpcMessage, RequestId, ServerNotification};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

const SUBSCRIBER_BUFFER: usize = 1024;
const RAW_PREVIEW_CHARS: usize = 200;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte streams to one agent, plus the process that owns them when there is one.
pub struct TransportIo {
    pub label: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub child: Option<Child>,
}

impl TransportIo {
    pub fn new(
        label: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportIo, ProviderError>> + Send + 'a>>;

/// Opens fresh byte streams to an agent. Pools call this once per connection
/// they create.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<'_>;

    fn describe(&self) -> String;
}

/// Everything the agent sends that is not a response to one of our requests.
/// `Closed` is delivered once, after every event read before the close.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Notification(ServerNotification),
    ServerRequest {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Malformed {
        error: String,
        raw: String,
    },
    Closed {
        reason: String,
    },
}

/// Runs on the reader task for every event, before the event is queued for
/// its subscriber. Must not block.
pub type EventHook = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

type PendingResult = Result<Value, ProviderError>;

#[derive(Default)]
struct PendingRequests {
    waiters: HashMap<RequestId, oneshot::Sender<PendingResult>>,
    closed: Option<String>,
}

impl PendingRequests {
    fn register(
        &mut self,
        id: RequestId,
    ) -> Result<oneshot::Receiver<PendingResult>, ProviderError> {
        if let Some(reason) = &self.closed {
            return Err(ProviderError::transport_closed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    fn resolve(&mut self, id: &RequestId, outcome: PendingResult) -> bool {
        match self.waiters.remove(id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Rejects every waiter. Returns `None` when already closed.
    fn close(&mut self, reason: &str) -> Option<usize> {
        if self.closed.is_some() {
            return None;
        }
        self.closed = Some(reason.to_string());
        let waiters = std::mem::take(&mut self.waiters);
        let rejected = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(ProviderError::transport_closed(reason)));
        }
        Some(rejected)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<InboundEvent>,
    hook: Option<EventHook>,
}

struct TransportShared {
    label: String,
    writer: Mutex<BoxedWriter>,
    pending: StdMutex<PendingRequests>,
    subscribers: StdMutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    child: StdMutex<Option<Child>>,
    parse_errors: AtomicU64,
    opened_at: Instant,
}

impl TransportShared {
    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_reason(&self) -> Option<String> {
        self.pending().closed.clone()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers().retain(|subscriber| subscriber.id != id);
    }

    /// Hands the event to every subscriber in turn. A subscriber whose buffer
    /// is full holds up the reader, and with it the agent's stdout, until it
    /// catches up.
    async fn publish(&self, event: InboundEvent) {
        let subscribers = self.subscribers().clone();
        for subscriber in &subscribers {
            if let Some(hook) = &subscriber.hook {
                hook(&event);
            }
        }
        for subscriber in subscribers {
            if subscriber.sender.send(event.clone()).await.is_err() {
                self.unsubscribe(subscriber.id);
            }
        }
    }

    fn age_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    fn shutdown(&self, reason: &str) {
        let Some(rejected) = self.pending().close(reason) else {
            return;
        };
        tracing::info!(
            transport = %self.label,
            reason = reason,
            rejected_requests = rejected,
            age_ms = self.age_ms(),
            "transport closed"
        );
        // Dropping the senders lets each subscription drain what it already
        // holds and then observe the close.
        let subscribers = std::mem::take(&mut *self.subscribers());
        let closed = InboundEvent::Closed {
            reason: reason.to_string(),
        };
        for subscriber in &subscribers {
            if let Some(hook) = &subscriber.hook {
                hook(&closed);
            }
        }
    }

    fn kill_child(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(transport = %self.label, code = status.code(), "agent process already exited");
                }
                _ => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(transport = %self.label, error = %err, "failed to kill agent process");
                    }
                }
            }
        }
    }

    async fn record_parse_error(&self, error: String, raw: &str, line_number: u64) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            transport = %self.label,
            error = %error,
            line_number = line_number,
            raw = %preview(raw),
            "agent stdout: invalid JSON-RPC line"
        );
        self.publish(InboundEvent::Malformed {
            error,
            raw: raw.to_string(),
        })
        .await;
    }

    async fn dispatch_line(&self, line: &str, line_number: u64) {
        let message = match JsonRpcMessage::parse_line(line) {
            Ok(message) => message,
            Err(err) => {
                self.record_parse_error(err.to_string(), line, line_number)
                    .await;
                return;
            }
        };

        match message {
            JsonRpcMessage::Response { id, outcome } => {
                let has_error = outcome.is_err();
                let outcome = outcome.map_err(rpc_error);
                if self.pending().resolve(&id, outcome) {
                    tracing::debug!(
                        transport = %self.label,
                        id = %id,
                        has_error = has_error,
                        "agent stdout: response matched to pending request"
                    );
                } else {
                    tracing::warn!(
                        transport = %self.label,
                        id = %id,
                        has_error = has_error,
                        "agent stdout: response has no matching pending request (orphan)"
                    );
                }
            }
            JsonRpcMessage::Notification { method, params } => {
                match ServerNotification::from_parts(&method, params) {
                    Ok(notification) => {
                        tracing::debug!(
                            transport = %self.label,
                            method = %method,
                            line_number = line_number,
                            "agent stdout: notification"
                        );
                        self.publish(InboundEvent::Notification(notification)).await;
                    }
                    Err(err) => {
                        self.record_parse_error(
                            format!("invalid `{method}` params: {err}"),
                            line,
                            line_number,
                        )
                        .await;
                    }
                }
            }
            JsonRpcMessage::Request { id, method, params } => {
                tracing::debug!(
                    transport = %self.label,
                    id = %id,
                    method = %method,
                    "agent stdout: server request"
                );
                self.publish(InboundEvent::ServerRequest { id, method, params })
                    .await;
            }
        }
    }
}

/// One line-delimited JSON-RPC stream to one agent.
pub struct Transport {
    shared: Arc<TransportShared>,
    next_id: AtomicI64,
    reader_task: JoinHandle<()>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.shared.label)
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Binds to the streams and starts the stdout reader. Must be called from
    /// within a tokio runtime.
    pub fn new(io: TransportIo) -> Self {
        let TransportIo {
            label,
            reader,
            writer,
            child,
        } = io;
        let shared = Arc::new(TransportShared {
            label,
            writer: Mutex::new(writer),
            pending: StdMutex::new(PendingRequests::default()),
            subscribers: StdMutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            child: StdMutex::new(child),
            parse_errors: AtomicU64::new(0),
            opened_at: Instant::now(),
        });
        let reader_task = tokio::spawn(read_loop(shared.clone(), reader));

        Self {
            shared,
            next_id: AtomicI64::new(1),
            reader_task,
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason().is_some()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.shared.closed_reason()
    }

    pub fn parse_error_count(&self) -> u64 {
        self.shared.parse_errors.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(None)
    }

    /// Registers a subscriber that sees every event read from now on. A
    /// subscription taken after the transport closed yields only `Closed`.
    pub fn subscribe_with(&self, hook: Option<EventHook>) -> Subscription {
        let (sender, events) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.shared.subscribers();
        if self.shared.closed_reason().is_none() {
            subscribers.push(Subscriber { id, sender, hook });
        }
        drop(subscribers);

        Subscription {
            id,
            events,
            shared: Arc::downgrade(&self.shared),
            closed: false,
        }
    }

    pub async fn send(&self, message: &JsonRpcMessage) -> Result<(), ProviderError> {
        if let Some(reason) = self.closed_reason() {
            return Err(ProviderError::transport_closed(reason));
        }

        let line = message.to_line();
        let method = message.method().unwrap_or("<response>");
        tracing::debug!(
            transport = %self.shared.label,
            method = method,
            bytes = line.len(),
            "stdin: writing message to agent"
        );

        let mut writer = self.shared.writer.lock().await;
        if let Err(err) = write_line(&mut writer, &line).await {
            drop(writer);
            let reason = format!("failed to write to agent stdin: {err}");
            tracing::error!(transport = %self.shared.label, method = method, error = %err, "stdin: write failed");
            self.shared.shutdown(&reason);
            return Err(ProviderError::transport_closed(reason));
        }
        Ok(())
    }

    /// Sends a request under a fresh id and waits for the response with the
    /// same id. Rejects if the transport closes first.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ProviderError> {
        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::SeqCst));
        let rx = self.shared.pending().register(id.clone())?;

        let message = JsonRpcMessage::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.send(&message).await {
            self.shared.pending().waiters.remove(&id);
            return Err(err);
        }

        let wait_start = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.pending().waiters.remove(&id);
                    tracing::error!(
                        transport = %self.shared.label,
                        method = method,
                        id = %id,
                        timeout_ms = limit.as_millis() as u64,
                        "request timed out waiting for agent response"
                    );
                    return Err(ProviderError::Timeout {
                        method: method.to_string(),
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    transport = %self.shared.label,
                    method = method,
                    id = %id,
                    response_ms = wait_start.elapsed().as_millis() as u64,
                    "got response from agent"
                );
                result
            }
            Err(_) => Err(ProviderError::transport_closed("response channel dropped")),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProviderError> {
        self.send(&JsonRpcMessage::Notification {
            method: method.to_string(),
            params,
        })
        .await
    }

    /// Answers a request the agent sent to us.
    pub async fn respond(
        &self,
        id: RequestId,
        outcome: Result<Value, JsonRpcError>,
    ) -> Result<(), ProviderError> {
        self.send(&JsonRpcMessage::Response { id, outcome }).await
    }

    pub fn close(&self) {
        self.shared.shutdown("transport closed by client");
        self.reader_task.abort();
        self.shared.kill_child();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bounded, ordered feed of one transport's inbound events. Dropping it
/// unregisters the subscriber.
pub struct Subscription {
    id: u64,
    events: mpsc::Receiver<InboundEvent>,
    shared: Weak<TransportShared>,
    closed: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Subscription {
    /// The next event, then a single `Closed` once the transport is gone,
    /// then `None`.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        if self.closed {
            return None;
        }
        match self.events.recv().await {
            Some(event) => Some(event),
            None => {
                self.closed = true;
                let reason = self
                    .shared
                    .upgrade()
                    .and_then(|shared| shared.closed_reason())
                    .unwrap_or_else(|| "transport dropped".to_string());
                Some(InboundEvent::Closed { reason })
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.id);
        }
    }
}

async fn read_loop(shared: Arc<TransportShared>, reader: BoxedReader) {
    let mut lines = BufReader::new(reader).lines();
    let mut line_count: u64 = 0;

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;
                shared.dispatch_line(trimmed, line_count).await;
            }
            Ok(None) => break "agent stdout closed".to_string(),
            Err(err) => break format!("failed to read agent stdout: {err}"),
        }
    };

    tracing::info!(
        transport = %shared.label,
        total_lines = line_count,
        age_ms = shared.age_ms(),
        "agent stdout: stream ended"
    );
    shared.shutdown(&reason);
}

async fn write_line(writer: &mut BoxedWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn rpc_error(error: JsonRpcError) -> ProviderError {
    ProviderError::Rpc(RpcError {
        code: error.code,
        message: error.message,
        data: error.data,
    })
}

fn preview(raw: &str) -> String {
    if raw.chars().count() > RAW_PREVIEW_CHARS {
        let head: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        raw.to_string()
    }
}
