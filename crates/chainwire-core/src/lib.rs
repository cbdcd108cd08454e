//! chainwire-core: transport abstraction and request scheduling for ChainWire.
//!
//! # Overview
//!
//! ChainWire turns many concurrent logical calls against a blockchain node
//! into as few wire operations as possible. The core crate defines:
//!
//! - [`RpcTransport`] / [`PubSubTransport`]: the contract every transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`]: error taxonomy with an explicit retry/reroute table
//! - [`policy`]: retry backoff and per-transport cooldown
//! - [`FallbackTransport`]: ranked multi-endpoint chain
//! - [`Scheduler`] / [`RpcClient`]: de-duplication cache and batch windows
//! - [`socket`]: connection engine shared by the WebSocket and IPC transports
//! - [`config`]: serde option records for building transports from JSON
//!
//! ```text
//! RpcClient ─► Scheduler ─► FallbackTransport ─► HttpRpcClient / WsRpcClient / IpcRpcClient
//!              (dedupe, batch)  (cooldown, rank)    (retry / reconnect)
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod fallback;
pub mod policy;
pub mod request;
pub mod scheduler;
pub mod socket;
pub mod transport;

pub use error::{CallError, ErrorKind, RetryDecision, TransportError, TransportFailure};
pub use fallback::{FallbackConfig, FallbackTransport, RankMode, RankOptions};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use scheduler::{Fingerprint, RpcClient, Scheduler, SchedulerConfig};
pub use socket::{ConnectionState, ResubscribePolicy, SocketClient, SocketConfig, Subscription};
pub use transport::{BatchConfig, HealthStatus, PubSubTransport, RpcTransport, TransportKind};
