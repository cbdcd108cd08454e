//! chainwire-http: buffered HTTP JSON-RPC transport for ChainWire.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainwire_core::RpcClient;
//! use chainwire_http::HttpRpcClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpRpcClient::default_for("https://rpc.example.com")?);
//! let client = RpcClient::new(transport);
//! let block = client.call("eth_blockNumber", vec![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;

pub use client::{HttpClientConfig, HttpRpcClient};
