#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use codex_provider::{
    AppServerProvider, MockAppServer, MockScript, PoolConfig, PoolRegistry, ProviderConfig,
    ProviderError, StreamChunk, TransportFactory, TurnStream,
};
use futures::StreamExt;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn mock(script: MockScript) -> Arc<MockAppServer> {
    Arc::new(MockAppServer::new(script))
}

pub fn factory(mock: &Arc<MockAppServer>) -> Arc<dyn TransportFactory> {
    mock.clone()
}

pub fn provider(
    pool: PoolConfig,
    factory: &Arc<dyn TransportFactory>,
    registry: &PoolRegistry,
) -> AppServerProvider {
    try_provider(pool, factory, registry).expect("create provider")
}

pub fn try_provider(
    pool: PoolConfig,
    factory: &Arc<dyn TransportFactory>,
    registry: &PoolRegistry,
) -> Result<AppServerProvider, ProviderError> {
    AppServerProvider::with_registry(ProviderConfig::new(pool), factory.clone(), registry.clone())
}

/// Pulls until the stream ends, failing the test if it stalls.
pub async fn drain(stream: &mut TurnStream) -> Vec<Result<StreamChunk, ProviderError>> {
    let mut chunks = Vec::new();
    while let Some(chunk) = tokio::time::timeout(STEP_TIMEOUT, stream.next())
        .await
        .expect("stream stalled")
    {
        chunks.push(chunk);
    }
    chunks
}

pub async fn next_chunk(stream: &mut TurnStream) -> Option<Result<StreamChunk, ProviderError>> {
    tokio::time::timeout(STEP_TIMEOUT, stream.next())
        .await
        .expect("stream stalled")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn delta_texts(chunks: &[Result<StreamChunk, ProviderError>]) -> Vec<String> {
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            Ok(StreamChunk::Delta { delta, .. }) => Some(delta.clone()),
            _ => None,
        })
        .collect()
}
