use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use codex_provider_error::ProviderError;
use codex_provider_protocol::{
    ClientInfo, ClientRequest, InitializeParams, InitializeResponse, JsonRpcError,
    ModelListParams, ModelListResponse, RequestId, ServerNotification, ThreadStartParams,
    ThreadStartResponse, TurnInterruptParams, TurnStartParams, TurnStartResponse,
    TurnSteerParams, TurnSteerResponse,
};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::transport::{EventHook, InboundEvent, Subscription, Transport, TransportIo};

const INITIALIZED_NOTIFICATION: &str = "initialized";

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A transport plus the `initialize` handshake and typed calls for the
/// methods the provider uses.
pub struct Connection {
    id: u64,
    transport: Transport,
    init: OnceCell<InitializeResponse>,
    request_timeout: Option<Duration>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Connection {
    pub fn new(io: TransportIo, request_timeout: Option<Duration>) -> Self {
        let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let transport = Transport::new(io);
        tracing::debug!(connection_id = id, transport = transport.label(), "connection opened");
        Self {
            id,
            transport,
            init: OnceCell::new(),
            request_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        self.transport.label()
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    pub fn server_info(&self) -> Option<&InitializeResponse> {
        self.init.get()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn parse_error_count(&self) -> u64 {
        self.transport.parse_error_count()
    }

    /// Runs the handshake at most once. Concurrent callers wait on the same
    /// in-flight `initialize`; after a failure the next caller retries.
    pub async fn initialize(
        &self,
        client_info: &ClientInfo,
    ) -> Result<&InitializeResponse, ProviderError> {
        self.init
            .get_or_try_init(|| async move {
                let response: InitializeResponse = self
                    .call(ClientRequest::Initialize(InitializeParams {
                        client_info: client_info.clone(),
                    }))
                    .await?;
                self.transport
                    .notify(INITIALIZED_NOTIFICATION, None)
                    .await?;
                tracing::info!(
                    connection_id = self.id,
                    server = response
                        .server_info
                        .as_ref()
                        .map(|info| info.name.as_str())
                        .unwrap_or("unknown"),
                    "connection initialized"
                );
                Ok(response)
            })
            .await
    }

    pub async fn call<R: DeserializeOwned>(&self, request: ClientRequest) -> Result<R, ProviderError> {
        let method = request.method();
        let params = request.params().map_err(|err| ProviderError::Parse {
            message: format!("failed to encode `{method}` params: {err}"),
        })?;
        let value = self.call_raw(method, Some(params)).await?;
        serde_json::from_value(value).map_err(|err| ProviderError::Parse {
            message: format!("invalid `{method}` response: {err}"),
        })
    }

    /// Untyped escape hatch for methods outside [`ClientRequest`].
    pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value, ProviderError> {
        self.transport
            .request(method, params, self.request_timeout)
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProviderError> {
        self.transport.notify(method, params).await
    }

    pub async fn respond(
        &self,
        id: RequestId,
        outcome: Result<Value, JsonRpcError>,
    ) -> Result<(), ProviderError> {
        self.transport.respond(id, outcome).await
    }

    pub async fn list_models(&self, params: ModelListParams) -> Result<ModelListResponse, ProviderError> {
        self.call(ClientRequest::ModelList(params)).await
    }

    /// Returns the new thread id.
    pub async fn thread_start(&self, params: ThreadStartParams) -> Result<String, ProviderError> {
        let response: ThreadStartResponse = self.call(ClientRequest::ThreadStart(params)).await?;
        response
            .thread_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse {
                message: "`thread/start` response carries no thread id".to_string(),
            })
    }

    /// Returns the new turn id.
    pub async fn turn_start(&self, params: TurnStartParams) -> Result<String, ProviderError> {
        let response: TurnStartResponse = self.call(ClientRequest::TurnStart(params)).await?;
        response
            .turn_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse {
                message: "`turn/start` response carries no turn id".to_string(),
            })
    }

    pub async fn turn_steer(&self, params: TurnSteerParams) -> Result<TurnSteerResponse, ProviderError> {
        self.call(ClientRequest::TurnSteer(params)).await
    }

    pub async fn turn_interrupt(&self, params: TurnInterruptParams) -> Result<(), ProviderError> {
        let _: Value = self.call(ClientRequest::TurnInterrupt(params)).await?;
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.transport.subscribe()
    }

    pub fn subscribe_with(&self, hook: EventHook) -> Subscription {
        self.transport.subscribe_with(Some(hook))
    }

    /// Inbound notifications in arrival order, optionally only those with the
    /// given method. Ends when the transport closes. The feed is bounded: a
    /// stream that is held but not polled stalls the connection's reader.
    pub fn notifications(&self, method: Option<&str>) -> BoxStream<'static, ServerNotification> {
        let wanted = method.map(str::to_string);
        let connection_id = self.id;
        stream::unfold(self.subscribe(), move |mut events| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match events.recv().await? {
                        InboundEvent::Notification(notification) => {
                            if wanted
                                .as_deref()
                                .map_or(true, |method| notification.method() == method)
                            {
                                return Some((notification, events));
                            }
                        }
                        InboundEvent::Closed { reason } => {
                            tracing::debug!(connection_id, reason = %reason, "notification stream ended");
                            return None;
                        }
                        InboundEvent::ServerRequest { .. } | InboundEvent::Malformed { .. } => {}
                    }
                }
            }
        })
        .boxed()
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
