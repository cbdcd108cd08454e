//! Shared engine for socket-based transports (WebSocket, IPC).
//!
//! A [`Connector`] turns an endpoint into a pair of text frame sink/stream;
//! [`SocketClient`] spawns a background [`connection`] task that owns that
//! pair, multiplexes requests by correlation id, routes subscription pushes
//! and reconnects after unexpected drops.
//!
//! States: `Connecting → Open → Closing → Closed`, with `Open → Connecting`
//! on an unexpected drop unless the client was closed explicitly or the
//! reconnect budget is exhausted.

mod connection;
pub mod subscriptions;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::request::{IdAllocator, JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::transport::{HealthStatus, PubSubTransport, RpcTransport, TransportKind};

use connection::{Command, Connection, Control};
pub use subscriptions::{SharedServerId, SubscriptionItem, SubscriptionKey, SubscriptionRegistry};

/// Outgoing half of a framed connection: one JSON message per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
/// Incoming half of a framed connection: one JSON message (or array) per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens framed connections to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;

    /// URL or socket path, for logs and errors.
    fn endpoint(&self) -> &str;
}

/// What happens to active subscriptions when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubscribePolicy {
    /// Re-issue every active subscription on the new connection. Caller
    /// handles keep receiving items under the new server id.
    Replay,
    /// Deliver `ConnectionClosed` to every subscriber and close its channel.
    Fail,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Configuration shared by socket transports.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Cache partition identity; defaults to the endpoint.
    pub key: Option<String>,
    /// Per-request deadline, measured from submission.
    pub request_timeout: Duration,
    /// Requests that may wait while the socket is not open.
    pub queue_capacity: usize,
    /// Reconnect after an unexpected drop.
    pub reconnect: bool,
    /// Consecutive failed connection attempts tolerated before closing.
    pub reconnect_attempts: u32,
    /// Reconnect backoff starting duration.
    pub reconnect_delay: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max_delay: Duration,
    /// Subscription handling across reconnects. Defaults to `Replay`.
    pub resubscribe: ResubscribePolicy,
    pub subscribe_method: String,
    pub unsubscribe_method: String,
    /// `method` of server push messages.
    pub notification_method: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            key: None,
            request_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            reconnect: true,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(60),
            resubscribe: ResubscribePolicy::Replay,
            subscribe_method: "eth_subscribe".into(),
            unsubscribe_method: "eth_unsubscribe".into(),
            notification_method: "eth_subscription".into(),
        }
    }
}

pub(crate) struct SubscriptionParts {
    key: SubscriptionKey,
    server_id: SharedServerId,
    items: mpsc::UnboundedReceiver<SubscriptionItem>,
}

/// Caller side of an active subscription.
///
/// Items arrive in push order. A terminal `Err` is followed by the end of
/// the stream. Dropping the handle unsubscribes.
pub struct Subscription {
    key: SubscriptionKey,
    server_id: SharedServerId,
    items: mpsc::UnboundedReceiver<SubscriptionItem>,
    control: mpsc::UnboundedSender<Control>,
    active: bool,
}

impl Subscription {
    /// Current server-assigned id (changes after a replay).
    pub fn id(&self) -> String {
        self.server_id.lock().clone()
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// Next pushed item, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        self.items.recv().await
    }

    /// Stop the subscription and close its channel.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.control.send(Control::Unsubscribe { key: self.key });
            self.items.close();
        }
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().items.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id())
            .finish()
    }
}

/// Socket JSON-RPC client driving one [`Connector`].
pub struct SocketClient {
    endpoint: String,
    key: String,
    kind: TransportKind,
    config: SocketConfig,
    commands: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    ids: Arc<IdAllocator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketClient {
    /// Start the background connection task. Returns immediately; requests
    /// issued before the socket opens are queued.
    pub fn spawn(connector: Arc<dyn Connector>, kind: TransportKind, config: SocketConfig) -> Self {
        let endpoint = connector.endpoint().to_string();
        let key = config.key.clone().unwrap_or_else(|| endpoint.clone());
        let (commands, command_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let shutdown = CancellationToken::new();
        let ids = Arc::new(IdAllocator::new());

        let connection = Connection::new(
            connector,
            config.clone(),
            command_rx,
            control_rx,
            state_tx,
            shutdown.clone(),
            ids.clone(),
        );
        let task = tokio::spawn(connection.run());

        Self {
            endpoint,
            key,
            kind,
            config,
            commands,
            control,
            state,
            shutdown,
            ids,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`. Fails with
    /// `ConnectionClosed` if the transport closes first.
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == target || *s == ConnectionState::Closed)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        if reached == target {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Close the connection, rejecting everything outstanding with
    /// `ConnectionClosed`, and wait for the background task to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ConnectionClosed {
            endpoint: self.endpoint.clone(),
        }
    }

    fn submit(&self, cmd: Command) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Closed {
            return Err(self.closed_error());
        }
        self.commands.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                capacity: self.config.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })
    }

    /// Send with an explicit deadline instead of the configured one.
    pub async fn send_with_timeout(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let caller_id = req.id.clone();
        let wire_id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Request {
            req: req.with_id(RpcId::Number(wire_id)),
            tx,
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                let _ = self.control.send(Control::Cancel { id: wire_id });
                Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(result)) => result.map(|mut resp| {
                resp.id = caller_id;
                resp
            }),
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RpcTransport for SocketClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.send_with_timeout(req, self.config.request_timeout).await
    }

    fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Open => HealthStatus::Healthy,
            ConnectionState::Connecting => HealthStatus::Degraded,
            ConnectionState::Closing | ConnectionState::Closed => HealthStatus::Unhealthy,
        }
    }

    fn url(&self) -> &str {
        &self.endpoint
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[async_trait]
impl PubSubTransport for SocketClient {
    async fn subscribe(&self, params: Vec<Value>) -> Result<Subscription, TransportError> {
        let wire_id = self.ids.next_id();
        let req = JsonRpcRequest::new(wire_id, self.config.subscribe_method.clone(), params);
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Subscribe { req, tx })?;

        let timeout = self.config.request_timeout;
        let parts = match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                let _ = self.control.send(Control::Cancel { id: wire_id });
                return Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                });
            }
            Ok(Err(_)) => return Err(self.closed_error()),
            Ok(Ok(result)) => result?,
        };

        Ok(Subscription {
            key: parts.key,
            server_id: parts.server_id,
            items: parts.items,
            control: self.control.clone(),
            active: true,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory connector: every `connect` hands the server half to the test.

    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};

    use super::*;

    pub struct ServerEnd {
        pub inbox: fmpsc::UnboundedReceiver<String>,
        pub outbox: fmpsc::UnboundedSender<Result<String, TransportError>>,
    }

    impl ServerEnd {
        pub async fn next_request(&mut self) -> JsonRpcRequest {
            let text = self.inbox.next().await.expect("client frame");
            serde_json::from_str(&text).expect("valid request")
        }

        pub fn push(&self, message: Value) {
            self.outbox
                .unbounded_send(Ok(message.to_string()))
                .expect("client stream open");
        }

        pub fn reply(&self, req: &JsonRpcRequest, result: Value) {
            self.push(serde_json::json!({"jsonrpc": "2.0", "id": req.id, "result": result}));
        }

        pub fn notify(&self, subscription: &str, result: Value) {
            self.push(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {"subscription": subscription, "result": result},
            }));
        }
    }

    pub struct MockConnector {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        refuse: AtomicU32,
    }

    impl MockConnector {
        /// Refuse the next `n` connection attempts.
        pub fn refuse_next(&self, n: u32) {
            self.refuse.store(n, Ordering::SeqCst);
        }
    }

    pub fn connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockConnector {
                accepted,
                refuse: AtomicU32::new(0),
            }),
            rx,
        )
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
            if self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Other("connection refused".into()));
            }
            let (to_server, inbox) = fmpsc::unbounded();
            let (outbox, from_server) = fmpsc::unbounded();
            let _ = self.accepted.send(ServerEnd { inbox, outbox });
            let sink = to_server.sink_map_err(|e| TransportError::Other(e.to_string()));
            Ok((Box::pin(sink), Box::pin(from_server)))
        }

        fn endpoint(&self) -> &str {
            "mock://node"
        }
    }
}
