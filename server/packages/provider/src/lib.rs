//! Streaming model provider over long-lived app-server agents.
//!
//! Agents speak line-delimited JSON-RPC on stdio. Connections are pooled per
//! provider or shared process-wide under a key, each turn is tracked by a
//! [`Session`], and its notifications are turned into a [`TurnStream`].

pub mod cli;
pub mod config;
pub mod connection;
pub mod launch;
pub mod mock;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

pub use codex_provider_error::{ErrorDetails, ErrorType, ProviderError, RpcError};
pub use config::{PoolConfig, PoolScope, ProviderConfig};
pub use connection::Connection;
pub use launch::{LaunchSpec, ProcessTransportFactory};
pub use mock::{MockAppServer, MockScript};
pub use pool::{ConnectionOptions, Pool, PoolSettings, PoolStats, PooledConnection};
pub use provider::{AppServerProvider, TurnRequest};
pub use registry::PoolRegistry;
pub use session::{Session, TurnState};
pub use stream::{StreamChunk, StreamState, TurnStream};
pub use transport::{
    EventHook, InboundEvent, Subscription, Transport, TransportFactory, TransportIo,
};
