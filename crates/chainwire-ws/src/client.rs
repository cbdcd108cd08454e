//! WebSocket JSON-RPC client with auto-reconnect and subscription management.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use chainwire_core::config::TransportOptions;
use chainwire_core::error::TransportError;
use chainwire_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainwire_core::socket::{
    ConnectionState, Connector, FrameSink, FrameStream, SocketClient, SocketConfig, Subscription,
};
use chainwire_core::transport::{HealthStatus, PubSubTransport, RpcTransport, TransportKind};

/// Configuration for the WebSocket client.
pub type WsClientConfig = SocketConfig;

/// Opens `tokio-tungstenite` connections and maps them to text frames.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok().map(Ok),
                Ok(Message::Close(frame)) => Some(Err(TransportError::WebSocket(format!(
                    "closed by peer: {frame:?}"
                )))),
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// WebSocket JSON-RPC client.
///
/// Maintains a background task that owns the WebSocket connection and
/// handles reconnect + re-subscribe logic transparently.
pub struct WsRpcClient {
    inner: SocketClient,
}

impl WsRpcClient {
    /// Start the background task for `url`. Returns without waiting for the
    /// handshake; requests issued before it completes are queued.
    pub fn connect(url: impl Into<String>, config: WsClientConfig) -> Result<Self, TransportError> {
        let url = url.into();
        let lower = url.to_ascii_lowercase();
        if !(lower.starts_with("ws://") || lower.starts_with("wss://")) {
            return Err(TransportError::InvalidRequest(format!(
                "not a WebSocket URL: {url}"
            )));
        }
        let connector = Arc::new(WsConnector::new(url));
        Ok(Self {
            inner: SocketClient::spawn(connector, TransportKind::Persistent, config),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::connect(url, WsClientConfig::default())
    }

    pub fn from_options(options: &TransportOptions) -> Result<Self, TransportError> {
        let url = options
            .url
            .clone()
            .ok_or_else(|| TransportError::InvalidRequest("WebSocket transport needs a url".into()))?;
        Self::connect(url, options.socket_config())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Wait for the connection to reach `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), TransportError> {
        self.inner.wait_for(state).await
    }

    pub async fn send_with_timeout(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.inner.send_with_timeout(req, timeout).await
    }

    /// Close the socket; pending requests and subscriptions end with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.inner.close().await
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.inner.send(req).await
    }

    fn health(&self) -> HealthStatus {
        self.inner.health()
    }

    fn url(&self) -> &str {
        self.inner.url()
    }

    fn key(&self) -> &str {
        self.inner.key()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }
}

#[async_trait]
impl PubSubTransport for WsRpcClient {
    async fn subscribe(&self, params: Vec<Value>) -> Result<Subscription, TransportError> {
        self.inner.subscribe(params).await
    }
}
