//! chainwire-ws: WebSocket JSON-RPC transport with auto-reconnect.
//!
//! # Features
//! - Auto-reconnect on disconnect (exponential backoff, bounded attempts)
//! - Subscription management (eth_subscribe / eth_unsubscribe)
//! - Replay or fail of active subscriptions after reconnect, chosen in config
//! - Request multiplexing over a single connection, queued while connecting

pub mod client;

pub use client::{WsClientConfig, WsConnector, WsRpcClient};
