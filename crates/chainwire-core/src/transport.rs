//! The `RpcTransport` trait, the core abstraction for all RPC endpoints.

use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::socket::Subscription;

/// Provider health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Provider is responding normally.
    Healthy,
    /// Provider is responding but degraded (reconnecting, recent failures).
    Degraded,
    /// Provider is not responding (closed, cooling down).
    Unhealthy,
    /// Health status is unknown (not yet checked).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Declared flavour of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One request/response per call (HTTP).
    Buffered,
    /// Long-lived bidirectional socket (WebSocket).
    Persistent,
    /// Framed local byte stream (IPC).
    Duplex,
    /// Combinator over other transports.
    Fallback,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered => write!(f, "buffered"),
            Self::Persistent => write!(f, "persistent"),
            Self::Duplex => write!(f, "duplex"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Batch window settings a transport asks its scheduler to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// How long the window stays open after its first request.
    pub wait: Duration,
    /// Flush as soon as this many requests are queued.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            wait: Duration::ZERO,
            max_size: 1000,
        }
    }
}

/// Per-request outcomes of a batch, in request order.
pub type BatchResponse = Vec<Result<JsonRpcResponse, TransportError>>;

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    ///
    /// A response carrying an `error` object is still `Ok`; it is the node's
    /// final answer and is never retried or rerouted.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a batch of JSON-RPC requests.
    ///
    /// The returned vector lines up with `reqs` by position regardless of
    /// the order the remote party answered in. The outer error means the
    /// whole batch failed. Default implementation sends them concurrently;
    /// override for true batching.
    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<BatchResponse, TransportError> {
        Ok(future::join_all(reqs.into_iter().map(|req| self.send(req))).await)
    }

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's identifier (URL, socket path or name).
    fn url(&self) -> &str;

    /// Cache partition identity used in request fingerprints.
    fn key(&self) -> &str {
        self.url()
    }

    fn kind(&self) -> TransportKind;

    /// Batch window to apply when a scheduler drives this transport.
    fn batch_config(&self) -> Option<BatchConfig> {
        None
    }

    /// Convenience: call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.send(req).await?;
        let result = resp.into_result().map_err(TransportError::Rpc)?;
        serde_json::from_value(result).map_err(TransportError::from)
    }
}

/// Transports that can carry server-pushed subscriptions.
#[async_trait]
pub trait PubSubTransport: RpcTransport {
    /// Open a subscription; `params` are passed to the subscribe method
    /// verbatim (e.g. `["newHeads"]`).
    async fn subscribe(&self, params: Vec<Value>) -> Result<Subscription, TransportError>;
}
