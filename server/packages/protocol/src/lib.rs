//! Wire types for the app-server JSON-RPC protocol.
//!
//! Messages travel as one JSON object per line. Every client request and
//! server notification the provider understands is a variant of a closed
//! enum, decoded and validated at the boundary.

pub mod client;
pub mod jsonrpc;
pub mod model;
pub mod server;

pub use client::{
    ClientInfo, ClientRequest, InitializeParams, InitializeResponse, ModelListParams,
    ModelListResponse, ServerInfo, TextElement, ThreadStartParams, ThreadStartResponse,
    TurnInterruptParams, TurnStartParams, TurnStartResponse, TurnSteerParams, TurnSteerResponse,
    UserInput,
};
pub use jsonrpc::{JsonRpcError, JsonRpcMessage, ParseError, RequestId, JSONRPC_VERSION};
pub use model::{Model, ReasoningEffortOption};
pub use server::{
    DeltaKind, ErrorNotification, ItemDeltaNotification, ItemNotification, ServerNotification,
    TurnCompletedNotification, TurnError, TurnStartedNotification, TurnStatus,
};
