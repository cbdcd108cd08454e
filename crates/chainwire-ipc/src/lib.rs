//! chainwire-ipc: duplex JSON-RPC transport over a local Unix domain socket.
//!
//! Messages are newline-delimited JSON. Serialized JSON never contains a raw
//! newline, so the delimiter marks message boundaries unambiguously on a
//! byte stream that has none of its own.
//!
//! The transport shares its connection engine with `chainwire-ws`: requests
//! queue while connecting, subscriptions are replayed or failed after a
//! reconnect, and `close` rejects everything outstanding.

#[cfg(unix)]
pub mod client;

#[cfg(unix)]
pub use client::{IpcClientConfig, IpcConnector, IpcRpcClient, MAX_FRAME_LENGTH};
