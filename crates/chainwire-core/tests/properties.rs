//! End-to-end behaviour of the scheduler, fallback chain and socket engine
//! through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use chainwire_core::batch;
use chainwire_core::policy::CooldownConfig;
use chainwire_core::scheduler::DedupeCache;
use chainwire_core::socket::{Connector, FrameSink, FrameStream};
use chainwire_core::transport::BatchResponse;
use chainwire_core::{
    BatchConfig, ConnectionState, FallbackConfig, FallbackTransport, Fingerprint, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, PubSubTransport, RankMode, ResubscribePolicy, RpcClient,
    RpcTransport, Scheduler, SchedulerConfig, SocketClient, SocketConfig, TransportError,
    TransportKind,
};

// ─── Buffered test transport ────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Mode {
    Echo,
    Down,
    Reverted,
    /// Echoes single calls; batch replies lose their last entry.
    Lossy,
}

struct Node {
    name: String,
    mode: Mode,
    batch: Option<BatchConfig>,
    sends: AtomicUsize,
    batches: AtomicUsize,
    batched_entries: AtomicUsize,
}

impl Node {
    fn new(name: &str, mode: Mode) -> Arc<Self> {
        Self::with_batch(name, mode, None)
    }

    fn with_batch(name: &str, mode: Mode, batch: Option<BatchConfig>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mode,
            batch,
            sends: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            batched_entries: AtomicUsize::new(0),
        })
    }

    fn answer(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        match self.mode {
            Mode::Echo | Mode::Lossy => Ok(JsonRpcResponse::success(
                req.id.clone(),
                json!({"node": self.name, "params": req.params}),
            )),
            Mode::Down => Err(TransportError::Http {
                status: None,
                message: "connection refused".into(),
            }),
            Mode::Reverted => Ok(JsonRpcResponse::failure(
                req.id.clone(),
                JsonRpcError {
                    code: 3,
                    message: "execution reverted".into(),
                    data: None,
                },
            )),
        }
    }
}

#[async_trait]
impl RpcTransport for Node {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.answer(&req)
    }

    /// Answers in reverse order; entries are matched back by id.
    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<BatchResponse, TransportError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.batched_entries.fetch_add(reqs.len(), Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        batch::validate(&reqs)?;
        let mut replies = reqs
            .iter()
            .map(|r| self.answer(r))
            .collect::<Result<Vec<_>, _>>()?;
        if matches!(self.mode, Mode::Lossy) {
            replies.pop();
        }
        replies.reverse();
        Ok(batch::correlate(&reqs, replies))
    }

    fn url(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Buffered
    }

    fn batch_config(&self) -> Option<BatchConfig> {
        self.batch
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_identical_calls_produce_one_wire_request() {
    let node = Node::new("a", Mode::Echo);
    let client = RpcClient::new(node.clone());

    let results = join_all((0..8).map(|_| client.call("eth_getBalance", vec![json!("0xabc")]))).await;

    assert_eq!(node.sends.load(Ordering::SeqCst), 1);
    let expected = json!({"node": "a", "params": ["0xabc"]});
    for result in results {
        assert_eq!(result.unwrap(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn permuted_batch_replies_reach_their_callers() {
    let node = Node::with_batch(
        "a",
        Mode::Echo,
        Some(BatchConfig {
            wait: Duration::from_millis(5),
            max_size: 10,
        }),
    );
    let client = RpcClient::new(node.clone());

    let calls = (0..4).map(|i| client.call("eth_getBalance", vec![json!(i)]));
    let results = join_all(calls).await;

    assert_eq!(node.batches.load(Ordering::SeqCst), 1);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["params"], json!([i]));
    }
}

#[test]
fn dedupe_cache_never_exceeds_capacity() {
    let mut cache = DedupeCache::new(3);
    let fps: Vec<Fingerprint> = (0..4)
        .map(|i| Fingerprint::new("a", "eth_getBlockByNumber", &[json!(i)]))
        .collect();
    for (i, fp) in fps.iter().take(3).enumerate() {
        assert!(cache.insert(fp.clone(), i).is_none());
    }
    let (evicted, _) = cache.insert(fps[3].clone(), 3).unwrap();
    assert_eq!(evicted, fps[0]);
    assert_eq!(cache.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn evicted_operations_still_resolve_their_callers() {
    let node = Node::new("a", Mode::Echo);
    let scheduler = Scheduler::new(SchedulerConfig { cache_capacity: 2 });
    let client = RpcClient::with_scheduler(node.clone(), scheduler.clone());

    let calls = (0..3).map(|i| client.call("eth_getCode", vec![json!(i)]));
    let all = join_all(calls);
    tokio::pin!(all);
    assert!(futures::poll!(&mut all).is_pending());
    assert_eq!(scheduler.in_flight(), 2);

    let results = all.await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(scheduler.in_flight(), 0);
}

// ─── Fallback ───────────────────────────────────────────────────────────────

fn fallback(members: &[Arc<Node>]) -> Arc<FallbackTransport> {
    let transports = members
        .iter()
        .map(|m| m.clone() as Arc<dyn RpcTransport>)
        .collect();
    Arc::new(FallbackTransport::new(
        transports,
        FallbackConfig {
            cooldown: CooldownConfig {
                cooldown: Duration::from_secs(30),
            },
            rank: RankMode::Ordered,
            ..Default::default()
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn failing_transport_is_skipped_within_cooldown() {
    let a = Node::new("a", Mode::Down);
    let b = Node::new("b", Mode::Echo);
    let client = RpcClient::new(fallback(&[a.clone(), b.clone()]));

    let first = client.call("eth_blockNumber", vec![]).await.unwrap();
    assert_eq!(first["node"], "b");
    assert_eq!(a.sends.load(Ordering::SeqCst), 1);
    assert_eq!(b.sends.load(Ordering::SeqCst), 1);

    let second = client.call("eth_blockNumber", vec![]).await.unwrap();
    assert_eq!(second["node"], "b");
    assert_eq!(a.sends.load(Ordering::SeqCst), 1);
    assert_eq!(b.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn node_error_never_reaches_second_transport() {
    let a = Node::new("a", Mode::Reverted);
    let b = Node::new("b", Mode::Echo);
    let client = RpcClient::new(fallback(&[a.clone(), b.clone()]));

    let err = client.call("eth_call", vec![json!({"to": "0x0"})]).await.unwrap_err();
    assert!(matches!(err.source, TransportError::Rpc(ref e) if e.code == 3));
    assert_eq!(b.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_chain_lists_every_failure() {
    let client = RpcClient::new(fallback(&[Node::new("a", Mode::Down), Node::new("b", Mode::Down)]));
    let err = client.call("eth_chainId", vec![]).await.unwrap_err();
    let TransportError::AllTransportsFailed(failures) = &err.source else {
        panic!("expected aggregate error, got {err}");
    };
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].transport, "a");
    assert_eq!(failures[1].transport, "b");
}

#[tokio::test(start_paused = true)]
async fn chains_sharing_a_scheduler_are_not_deduplicated_together() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let mainnet = RpcClient::with_scheduler(fallback(&[Node::new("mainnet", Mode::Echo)]), scheduler.clone());
    let sepolia = RpcClient::with_scheduler(fallback(&[Node::new("sepolia", Mode::Echo)]), scheduler.clone());

    let (a, b) = tokio::join!(
        mainnet.call("eth_chainId", vec![]),
        sepolia.call("eth_chainId", vec![]),
    );
    assert_eq!(a.unwrap()["node"], "mainnet");
    assert_eq!(b.unwrap()["node"], "sepolia");
}

#[tokio::test(start_paused = true)]
async fn chain_batches_with_the_leading_member_window() {
    let window = Some(BatchConfig {
        wait: Duration::from_millis(5),
        max_size: 10,
    });
    let a = Node::with_batch("a", Mode::Echo, window);
    let chain = fallback(&[a.clone(), Node::new("b", Mode::Echo)]);
    assert_eq!(chain.batch_config(), window);

    let client = RpcClient::new(chain);
    let results = join_all((0..3).map(|i| client.call("eth_getBalance", vec![json!(i)]))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(a.batches.load(Ordering::SeqCst), 1);
    assert_eq!(a.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn only_unanswered_batch_entries_move_to_the_next_member() {
    let a = Node::new("a", Mode::Lossy);
    let b = Node::new("b", Mode::Echo);
    let chain = fallback(&[a.clone(), b.clone()]);

    let reqs = (0..3u64)
        .map(|i| JsonRpcRequest::new(i, "eth_getBalance", vec![json!(i)]))
        .collect();
    let replies = chain.send_batch(reqs).await.unwrap();
    let nodes: Vec<Value> = replies
        .into_iter()
        .map(|r| r.unwrap().result.unwrap()["node"].clone())
        .collect();
    assert_eq!(nodes, [json!("a"), json!("a"), json!("b")]);

    assert_eq!(b.batches.load(Ordering::SeqCst), 1);
    assert_eq!(b.batched_entries.load(Ordering::SeqCst), 1);
    let summary = chain.health_summary();
    assert_eq!(summary[0].0, "a");
    assert_eq!(summary[0].2, 1, "a demoted for the lost entry");
}

// ─── Socket engine ──────────────────────────────────────────────────────────

struct Peer {
    inbox: fmpsc::UnboundedReceiver<String>,
    outbox: fmpsc::UnboundedSender<Result<String, TransportError>>,
}

impl Peer {
    async fn request(&mut self) -> JsonRpcRequest {
        let text = self.inbox.next().await.expect("frame from client");
        serde_json::from_str(&text).expect("request")
    }

    fn send(&self, message: Value) {
        self.outbox.unbounded_send(Ok(message.to_string())).expect("client listening");
    }

    fn ack(&self, req: &JsonRpcRequest, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": req.id, "result": result}));
    }
}

struct Loopback {
    peers: mpsc::UnboundedSender<Peer>,
}

#[async_trait]
impl Connector for Loopback {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (to_peer, inbox) = fmpsc::unbounded();
        let (outbox, from_peer) = fmpsc::unbounded();
        self.peers
            .send(Peer { inbox, outbox })
            .map_err(|_| TransportError::Other("test finished".into()))?;
        let sink = to_peer.sink_map_err(|e| TransportError::Other(e.to_string()));
        Ok((Box::pin(sink), Box::pin(from_peer)))
    }

    fn endpoint(&self) -> &str {
        "loopback"
    }
}

fn socket(policy: ResubscribePolicy) -> (SocketClient, mpsc::UnboundedReceiver<Peer>) {
    let (peers, rx) = mpsc::unbounded_channel();
    let config = SocketConfig {
        resubscribe: policy,
        reconnect_delay: Duration::from_millis(5),
        ..Default::default()
    };
    let client = SocketClient::spawn(Arc::new(Loopback { peers }), TransportKind::Persistent, config);
    (client, rx)
}

async fn open_two_subscriptions(
    client: &SocketClient,
    peer: &mut Peer,
) -> (chainwire_core::Subscription, chainwire_core::Subscription) {
    let (heads, logs, ()) = tokio::join!(
        client.subscribe(vec![json!("newHeads")]),
        client.subscribe(vec![json!("logs")]),
        async {
            for id in ["0x1", "0x2"] {
                let req = peer.request().await;
                peer.ack(&req, json!(id));
            }
        }
    );
    (heads.unwrap(), logs.unwrap())
}

#[tokio::test]
async fn replay_policy_reissues_both_subscriptions() {
    let (client, mut peers) = socket(ResubscribePolicy::Replay);
    let mut peer = peers.recv().await.unwrap();
    let (mut heads, mut logs) = open_two_subscriptions(&client, &mut peer).await;
    drop(peer);

    let mut peer = peers.recv().await.unwrap();
    let mut replayed = Vec::new();
    for id in ["0x3", "0x4"] {
        let req = peer.request().await;
        assert_eq!(req.method, "eth_subscribe");
        replayed.push(req.params[0].clone());
        peer.ack(&req, json!(id));
    }
    replayed.sort_by_key(|v| v.to_string());
    assert_eq!(replayed, vec![json!("logs"), json!("newHeads")]);

    for id in ["0x3", "0x4"] {
        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": id, "result": id},
        }));
    }
    let a = heads.recv().await.unwrap().unwrap();
    let b = logs.recv().await.unwrap().unwrap();
    assert_ne!(a, b);
    assert_eq!(json!(heads.id()), a);
    assert_eq!(json!(logs.id()), b);
}

#[tokio::test]
async fn fail_policy_fails_both_subscriptions() {
    let (client, mut peers) = socket(ResubscribePolicy::Fail);
    let mut peer = peers.recv().await.unwrap();
    let (mut heads, mut logs) = open_two_subscriptions(&client, &mut peer).await;
    drop(peer);

    for sub in [&mut heads, &mut logs] {
        let item = sub.recv().await.expect("terminal error");
        assert!(matches!(item, Err(TransportError::ConnectionClosed { .. })));
        assert!(sub.recv().await.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn short_timeout_fires_independently_of_longer_requests() {
    let (client, mut peers) = socket(ResubscribePolicy::Replay);
    let _peer = peers.recv().await.unwrap();
    client.wait_for(ConnectionState::Open).await.unwrap();

    let long = client.send(JsonRpcRequest::new(1, "eth_getLogs", vec![]));
    tokio::pin!(long);
    assert!(futures::poll!(&mut long).is_pending());

    let start = Instant::now();
    let err = client
        .send_with_timeout(JsonRpcRequest::new(2, "eth_blockNumber", vec![]), Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, TransportError::Timeout { ms: 50 }));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(60));
    assert!(futures::poll!(&mut long).is_pending());
}
