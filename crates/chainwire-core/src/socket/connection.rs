//! Background task that owns a socket connection.
//!
//! The task is the only owner of the pending-request map and the
//! subscription registry. Callers reach it through two channels: a bounded
//! request queue (only drained while the connection is open, so requests
//! issued while connecting are flushed in submission order once it opens)
//! and an unbounded control channel for cancellations and unsubscribes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::request::{IdAllocator, JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionNotification};

use super::subscriptions::{SubscriptionKey, SubscriptionRegistry};
use super::{
    ConnectionState, Connector, FrameSink, FrameStream, ResubscribePolicy, SocketConfig,
    SubscriptionParts,
};

pub(crate) type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
pub(crate) type SubscribeSender = oneshot::Sender<Result<SubscriptionParts, TransportError>>;

/// Work submitted by callers, queued while the socket is not open.
pub(crate) enum Command {
    Request { req: JsonRpcRequest, tx: ResponseSender },
    Subscribe { req: JsonRpcRequest, tx: SubscribeSender },
}

/// Bookkeeping that must not wait behind queued requests.
pub(crate) enum Control {
    /// The caller stopped waiting for this wire id.
    Cancel { id: u64 },
    Unsubscribe { key: SubscriptionKey },
}

enum Pending {
    Request(ResponseSender),
    Subscribe {
        key: SubscriptionKey,
        req: JsonRpcRequest,
        tx: SubscribeSender,
    },
    Resubscribe { key: SubscriptionKey },
    /// The caller timed out before the acknowledgement; a late ack is
    /// answered with an unsubscribe.
    AbandonedSubscribe,
    /// Response is not awaited by anyone (unsubscribe acknowledgements).
    Ignore,
}

enum Outcome {
    Shutdown,
    Dropped,
}

pub(crate) struct Connection {
    connector: Arc<dyn Connector>,
    config: SocketConfig,
    commands: mpsc::Receiver<Command>,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    ids: Arc<IdAllocator>,
    pending: HashMap<u64, Pending>,
    subscriptions: SubscriptionRegistry,
    next_key: u64,
}

impl Connection {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: SocketConfig,
        commands: mpsc::Receiver<Command>,
        control: mpsc::UnboundedReceiver<Control>,
        state: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
        ids: Arc<IdAllocator>,
    ) -> Self {
        Self {
            connector,
            config,
            commands,
            control,
            state,
            shutdown,
            ids,
            pending: HashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            next_key: 1,
        }
    }

    fn endpoint(&self) -> String {
        self.connector.endpoint().to_string()
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ConnectionClosed {
            endpoint: self.endpoint(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(endpoint = %self.connector.endpoint(), %state, "socket state");
        self.state.send_replace(state);
    }

    pub(crate) async fn run(mut self) {
        let mut failures = 0u32;
        let mut backoff = self.config.reconnect_delay;

        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(endpoint = %self.connector.endpoint(), "connecting");

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                conn = self.connector.connect() => conn,
            };

            match connected {
                Err(e) => {
                    failures += 1;
                    if !self.config.reconnect || failures > self.config.reconnect_attempts {
                        tracing::error!(
                            endpoint = %self.connector.endpoint(),
                            error = %e,
                            attempts = failures,
                            "giving up on connection"
                        );
                        break;
                    }
                    tracing::warn!(error = %e, "connect failed, retrying in {backoff:?}");
                }
                Ok((sink, stream)) => {
                    failures = 0;
                    backoff = self.config.reconnect_delay;
                    self.set_state(ConnectionState::Open);

                    match self.drive(sink, stream).await {
                        Outcome::Shutdown => break,
                        Outcome::Dropped => {
                            self.on_drop();
                            if !self.config.reconnect {
                                break;
                            }
                            tracing::warn!(
                                endpoint = %self.connector.endpoint(),
                                "disconnected, reconnecting in {backoff:?}"
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max_delay);
        }

        self.teardown();
    }

    /// Exchange frames until the connection drops or the client shuts down.
    async fn drive(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> Outcome {
        if self.replay_subscriptions(&mut sink).await.is_err() {
            return Outcome::Dropped;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return Outcome::Shutdown;
                }
                Some(ctl) = self.control.recv() => {
                    if let Err(e) = self.handle_control(ctl, &mut sink).await {
                        tracing::warn!(error = %e, "socket send failed");
                        return Outcome::Dropped;
                    }
                }
                frame = stream.next() => match frame {
                    None => return Outcome::Dropped,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket receive error");
                        return Outcome::Dropped;
                    }
                    Some(Ok(text)) => {
                        if let Err(e) = self.handle_frame(&text, &mut sink).await {
                            tracing::warn!(error = %e, "socket send failed");
                            return Outcome::Dropped;
                        }
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    // Client handle dropped.
                    None => {
                        let _ = sink.close().await;
                        return Outcome::Shutdown;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd, &mut sink).await {
                            tracing::warn!(error = %e, "socket send failed");
                            return Outcome::Dropped;
                        }
                    }
                },
            }
        }
    }

    async fn write(sink: &mut FrameSink, req: &JsonRpcRequest) -> Result<(), TransportError> {
        let text = serde_json::to_string(req)?;
        sink.send(text).await
    }

    async fn replay_subscriptions(&mut self, sink: &mut FrameSink) -> Result<(), TransportError> {
        if self.config.resubscribe != ResubscribePolicy::Replay || self.subscriptions.is_empty() {
            return Ok(());
        }
        let replays = self.subscriptions.replay_requests();
        tracing::info!(count = replays.len(), "replaying subscriptions");
        for (key, req) in replays {
            let id = self.ids.next_id();
            self.pending.insert(id, Pending::Resubscribe { key });
            Self::write(sink, &req.with_id(RpcId::Number(id))).await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command, sink: &mut FrameSink) -> Result<(), TransportError> {
        match cmd {
            Command::Request { req, tx } => {
                // Caller timed out while the request sat in the queue.
                if tx.is_closed() {
                    return Ok(());
                }
                let Some(id) = wire_id(&req.id) else {
                    let _ = tx.send(Err(TransportError::InvalidRequest(
                        "socket requests need a numeric id".into(),
                    )));
                    return Ok(());
                };
                self.pending.insert(id, Pending::Request(tx));
                Self::write(sink, &req).await
            }
            Command::Subscribe { req, tx } => {
                if tx.is_closed() {
                    return Ok(());
                }
                let Some(id) = wire_id(&req.id) else {
                    let _ = tx.send(Err(TransportError::InvalidRequest(
                        "socket requests need a numeric id".into(),
                    )));
                    return Ok(());
                };
                let key = SubscriptionKey(self.next_key);
                self.next_key += 1;
                self.pending.insert(
                    id,
                    Pending::Subscribe {
                        key,
                        req: req.clone(),
                        tx,
                    },
                );
                Self::write(sink, &req).await
            }
        }
    }

    async fn handle_control(&mut self, ctl: Control, sink: &mut FrameSink) -> Result<(), TransportError> {
        match ctl {
            Control::Cancel { id } => {
                if let Some(Pending::Subscribe { .. }) = self.pending.remove(&id) {
                    self.pending.insert(id, Pending::AbandonedSubscribe);
                }
                Ok(())
            }
            Control::Unsubscribe { key } => match self.subscriptions.remove(key) {
                Some(server_id) => self.send_unsubscribe(server_id, sink).await,
                None => Ok(()),
            },
        }
    }

    async fn send_unsubscribe(&mut self, server_id: String, sink: &mut FrameSink) -> Result<(), TransportError> {
        let id = self.ids.next_id();
        self.pending.insert(id, Pending::Ignore);
        let req = JsonRpcRequest::new(
            id,
            self.config.unsubscribe_method.clone(),
            vec![Value::String(server_id)],
        );
        Self::write(sink, &req).await
    }

    async fn handle_frame(&mut self, text: &str, sink: &mut FrameSink) -> Result<(), TransportError> {
        let Ok(val) = serde_json::from_str::<Value>(text) else {
            tracing::debug!("failed to parse socket frame as JSON");
            return Ok(());
        };
        match val {
            Value::Array(items) => {
                for item in items {
                    self.handle_message(item, sink).await?;
                }
                Ok(())
            }
            other => self.handle_message(other, sink).await,
        }
    }

    async fn handle_message(&mut self, val: Value, sink: &mut FrameSink) -> Result<(), TransportError> {
        if val.get("method").and_then(|m| m.as_str()) == Some(self.config.notification_method.as_str()) {
            match serde_json::from_value::<SubscriptionNotification>(val) {
                Ok(n) => {
                    if !self.subscriptions.dispatch(&n.params.subscription, n.params.result) {
                        tracing::debug!(subscription = %n.params.subscription, "notification for unknown subscription");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "malformed notification"),
            }
            return Ok(());
        }

        let resp = match serde_json::from_value::<JsonRpcResponse>(val) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "unrecognised socket message");
                return Ok(());
            }
        };
        let Some(id) = wire_id(&resp.id) else {
            return Ok(());
        };
        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!(id, "response for unknown request id");
            return Ok(());
        };

        match pending {
            Pending::Request(tx) => {
                let _ = tx.send(Ok(resp));
            }
            Pending::Subscribe { key, req, tx } => match subscription_id(resp) {
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
                Ok(server_id) => {
                    let (item_tx, item_rx) = mpsc::unbounded_channel();
                    let shared = Arc::new(Mutex::new(server_id.clone()));
                    self.subscriptions.register(key, shared.clone(), req, item_tx);
                    let parts = SubscriptionParts {
                        key,
                        server_id: shared,
                        items: item_rx,
                    };
                    if tx.send(Ok(parts)).is_err() {
                        // Caller gave up before the acknowledgement arrived.
                        if let Some(server_id) = self.subscriptions.remove(key) {
                            self.send_unsubscribe(server_id, sink).await?;
                        }
                    }
                }
            },
            Pending::Resubscribe { key } => match subscription_id(resp) {
                Err(e) => {
                    tracing::warn!(error = %e, "subscription replay rejected");
                    self.subscriptions.fail(key, e);
                }
                Ok(server_id) => {
                    if !self.subscriptions.rekey(key, server_id.clone()) {
                        self.send_unsubscribe(server_id, sink).await?;
                    }
                }
            },
            Pending::AbandonedSubscribe => {
                if let Ok(server_id) = subscription_id(resp) {
                    tracing::debug!(subscription = %server_id, "late acknowledgement, unsubscribing");
                    self.send_unsubscribe(server_id, sink).await?;
                }
            }
            Pending::Ignore => {}
        }
        Ok(())
    }

    fn reject_pending(&mut self, error: &TransportError) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Request(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                Pending::Subscribe { tx, .. } => {
                    let _ = tx.send(Err(error.clone()));
                }
                Pending::Resubscribe { .. } | Pending::AbandonedSubscribe | Pending::Ignore => {}
            }
        }
    }

    /// Settle everything that depended on the connection that just dropped.
    fn on_drop(&mut self) {
        let closed = self.closed_error();
        self.reject_pending(&closed);
        match self.config.resubscribe {
            ResubscribePolicy::Replay => self.subscriptions.detach_all(),
            ResubscribePolicy::Fail => {
                if !self.subscriptions.is_empty() {
                    tracing::warn!(
                        count = self.subscriptions.len(),
                        "failing subscriptions after disconnect"
                    );
                }
                self.subscriptions.fail_all(&closed);
            }
        }
    }

    /// Reject everything still outstanding and mark the transport closed.
    fn teardown(&mut self) {
        self.set_state(ConnectionState::Closing);
        let closed = self.closed_error();
        self.reject_pending(&closed);
        self.subscriptions.fail_all(&closed);

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Request { tx, .. } => {
                    let _ = tx.send(Err(closed.clone()));
                }
                Command::Subscribe { tx, .. } => {
                    let _ = tx.send(Err(closed.clone()));
                }
            }
        }
        self.set_state(ConnectionState::Closed);
        tracing::info!(endpoint = %self.connector.endpoint(), "connection closed");
    }
}

fn wire_id(id: &RpcId) -> Option<u64> {
    match id {
        RpcId::Number(n) => Some(*n),
        _ => None,
    }
}

/// Extract the server-assigned id from a subscribe acknowledgement.
fn subscription_id(resp: JsonRpcResponse) -> Result<String, TransportError> {
    match resp.into_result().map_err(TransportError::Rpc)? {
        Value::String(s) => Ok(s),
        other => Err(TransportError::InvalidResponse(format!(
            "subscription id must be a string, got {other}"
        ))),
    }
}
