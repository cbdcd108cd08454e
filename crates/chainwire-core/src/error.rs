//! Transport-level error types and the retry / fallback decision table.

use thiserror::Error;

use crate::request::{JsonRpcError, RpcId};

/// Errors that can occur during an RPC transport operation.
///
/// `Clone` so a single wire outcome can be handed to every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// HTTP request failed. `status` is `None` when no response was received.
    #[error("HTTP error{}: {message}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Local IPC channel error.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The socket was torn down while the request or subscription was live.
    #[error("Connection closed: {endpoint}")]
    ConnectionClosed { endpoint: String },

    /// Outbound queue of a socket transport is full.
    #[error("Request queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The remote party answered with something that is not a valid reply.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A batch reply did not contain an entry for this request id.
    #[error("No response for request id {id}")]
    MissingResponse { id: RpcId },

    /// The request could not be sent as built (e.g. duplicate batch ids).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Every transport of a fallback chain failed.
    #[error("All transports failed: {}", format_failures(.0))]
    AllTransportsFailed(Vec<TransportFailure>),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

/// One member's failure inside [`TransportError::AllTransportsFailed`].
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub transport: String,
    pub error: TransportError,
}

fn format_failures(failures: &[TransportFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.transport, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

/// Coarse classification used by retry and fallback logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused, reset, DNS, socket I/O.
    Network,
    /// HTTP status that usually clears up on its own.
    TransientStatus,
    /// HTTP status that will fail the same way again.
    PermanentStatus,
    Timeout,
    ConnectionClosed,
    QueueFull,
    /// Unparseable or mismatched reply.
    Protocol,
    InvalidRequest,
    /// The node answered with a JSON-RPC error.
    Node,
    Exhausted,
}

/// What the retry loop and the fallback combinator may do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Retry on the same transport.
    pub retry: bool,
    /// Move on to the next transport of a fallback chain.
    pub reroute: bool,
}

/// HTTP status codes retried by the buffered transport.
pub const RETRYABLE_STATUS: &[u16] = &[403, 408, 413, 429, 500, 502, 503, 504];

impl ErrorKind {
    pub fn retry_decision(self) -> RetryDecision {
        let (retry, reroute) = match self {
            Self::Network => (true, true),
            Self::TransientStatus => (true, true),
            Self::PermanentStatus => (false, true),
            Self::Timeout => (true, true),
            Self::ConnectionClosed => (false, true),
            Self::QueueFull => (false, true),
            Self::Protocol => (false, true),
            Self::InvalidRequest => (false, false),
            Self::Node => (false, false),
            Self::Exhausted => (false, false),
        };
        RetryDecision { retry, reroute }
    }
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { status: None, .. } | Self::WebSocket(_) | Self::Ipc(_) => {
                ErrorKind::Network
            }
            Self::Http {
                status: Some(code), ..
            } => {
                if RETRYABLE_STATUS.contains(code) {
                    ErrorKind::TransientStatus
                } else {
                    ErrorKind::PermanentStatus
                }
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::InvalidResponse(_)
            | Self::MissingResponse { .. }
            | Self::Deserialization(_)
            | Self::Other(_) => ErrorKind::Protocol,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Rpc(_) => ErrorKind::Node,
            Self::AllTransportsFailed(_) => ErrorKind::Exhausted,
        }
    }

    /// Returns `true` if the owning transport may retry this error itself.
    pub fn is_retryable(&self) -> bool {
        self.kind().retry_decision().retry
    }

    /// Returns `true` if a fallback chain should try its next transport.
    pub fn should_reroute(&self) -> bool {
        self.kind().retry_decision().reroute
    }

    /// Returns `true` if this is a node-side execution error (not retryable).
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Error surfaced to a logical caller of the scheduler.
#[derive(Debug, Clone, Error)]
#[error("{method} failed (request {fingerprint}): {source}")]
pub struct CallError {
    pub method: String,
    pub fingerprint: String,
    #[source]
    pub source: TransportError,
}

impl CallError {
    pub fn transport_error(&self) -> &TransportError {
        &self.source
    }
}
