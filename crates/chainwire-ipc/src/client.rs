//! IPC JSON-RPC client over a Unix domain socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

use chainwire_core::config::TransportOptions;
use chainwire_core::error::TransportError;
use chainwire_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainwire_core::socket::{
    ConnectionState, Connector, FrameSink, FrameStream, SocketClient, SocketConfig, Subscription,
};
use chainwire_core::transport::{HealthStatus, PubSubTransport, RpcTransport, TransportKind};

/// Longest accepted line; a larger frame fails the connection.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Configuration for the IPC client.
pub type IpcClientConfig = SocketConfig;

/// Connects to a Unix socket and frames it with [`LinesCodec`].
pub struct IpcConnector {
    path: PathBuf,
    endpoint: String,
    max_frame_length: usize,
}

impl IpcConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            endpoint: path.display().to_string(),
            path,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for IpcConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| TransportError::Ipc(format!("failed to connect to {}: {e}", self.endpoint)))?;

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(self.max_frame_length));
        let (sink, stream) = framed.split::<String>();

        let sink = sink.sink_map_err(|e| TransportError::Ipc(e.to_string()));
        let stream = stream.map(|line| line.map_err(|e| TransportError::Ipc(e.to_string())));

        Ok((Box::pin(sink), Box::pin(stream)))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// IPC JSON-RPC client.
///
/// Same contract as the WebSocket client: one shared channel, correlation
/// by id, subscriptions keyed by the server's push id.
pub struct IpcRpcClient {
    inner: SocketClient,
}

impl IpcRpcClient {
    /// Start the background task for the socket at `path`. Returns without
    /// waiting for the connection; requests issued before it opens are queued.
    pub fn connect(path: impl Into<PathBuf>, config: IpcClientConfig) -> Self {
        Self::with_connector(IpcConnector::new(path), config)
    }

    pub fn with_connector(connector: IpcConnector, config: IpcClientConfig) -> Self {
        Self {
            inner: SocketClient::spawn(Arc::new(connector), TransportKind::Duplex, config),
        }
    }

    /// Create with default configuration.
    pub fn default_for(path: impl Into<PathBuf>) -> Self {
        Self::connect(path, IpcClientConfig::default())
    }

    pub fn from_options(options: &TransportOptions) -> Result<Self, TransportError> {
        let path = options
            .path
            .clone()
            .or_else(|| options.url.as_ref().map(PathBuf::from))
            .ok_or_else(|| TransportError::InvalidRequest("IPC transport needs a path".into()))?;
        Ok(Self::connect(path, options.socket_config()))
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

    pub async fn close(&self) {
        self.inner.close().await
    }
}

#[async_trait]
impl RpcTransport for IpcRpcClient {
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
        TransportKind::Duplex
    }
}

#[async_trait]
impl PubSubTransport for IpcRpcClient {
    async fn subscribe(&self, params: Vec<Value>) -> Result<Subscription, TransportError> {
        self.inner.subscribe(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwire_core::request::RpcId;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn reply(req: &Value, result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": req["id"], "result": result}).to_string()
    }

    /// Node that answers every request with its method name and acks
    /// `eth_subscribe` with `0x9` plus one push.
    fn spawn_framed_node(listener: UnixListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, LinesCodec::new());
                    while let Some(Ok(line)) = framed.next().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        let method = req["method"].as_str().unwrap().to_string();
                        if method == "eth_subscribe" {
                            framed.send(reply(&req, json!("0x9"))).await.unwrap();
                            let push = json!({"jsonrpc": "2.0", "method": "eth_subscription",
                                              "params": {"subscription": "0x9", "result": "0xbeef"}});
                            framed.send(push.to_string()).await.unwrap();
                        } else {
                            framed.send(reply(&req, json!(method))).await.unwrap();
                        }
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.ipc");
        spawn_framed_node(UnixListener::bind(&path).unwrap());

        let client = IpcRpcClient::default_for(&path);
        let resp = client
            .send(JsonRpcRequest::new(3, "eth_chainId", vec![]))
            .await
            .unwrap();
        assert_eq!(resp.id, RpcId::Number(3));
        assert_eq!(resp.result, Some(json!("eth_chainId")));
        assert_eq!(client.kind(), TransportKind::Duplex);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn subscription_receives_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.ipc");
        spawn_framed_node(UnixListener::bind(&path).unwrap());

        let client = IpcRpcClient::default_for(&path);
        let mut sub = client.subscribe(vec![json!("newHeads")]).await.unwrap();
        assert_eq!(sub.id(), "0x9");
        assert_eq!(sub.recv().await.unwrap().unwrap(), json!("0xbeef"));
    }

    #[tokio::test]
    async fn frames_split_or_coalesced_on_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.ipc");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let a: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let b: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();

            // Second answer first, split across two writes...
            let second = reply(&b, json!("b")) + "\n";
            let (head, tail) = second.split_at(10);
            write.write_all(head.as_bytes()).await.unwrap();
            write.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write.write_all(tail.as_bytes()).await.unwrap();
            // ...then the first one together with a stray blank line.
            let first = reply(&a, json!("a")) + "\n\n";
            write.write_all(first.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let client = IpcRpcClient::default_for(&path);
        let (a, b) = tokio::join!(
            client.send(JsonRpcRequest::new(1, "a", vec![])),
            client.send(JsonRpcRequest::new(2, "b", vec![])),
        );
        assert_eq!(a.unwrap().result, Some(json!("a")));
        assert_eq!(b.unwrap().result, Some(json!("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_socket_gives_up_after_reconnect_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpcClientConfig {
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(10),
            ..IpcClientConfig::default()
        };
        let client = IpcRpcClient::connect(dir.path().join("absent.ipc"), config);
        let err = client.wait_for(ConnectionState::Open).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed { .. }));
        assert_eq!(client.health(), HealthStatus::Unhealthy);
    }
}
