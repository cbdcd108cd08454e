//! Multi-endpoint fallback transport with cooldown-based demotion.
//!
//! Members are tried in rank order. A member that fails with a transport-level
//! error is demoted for the cooldown window and the next member is tried; a
//! node-level error ends the chain immediately since the node has answered.
//!
//! Batches are rerouted entry by entry: only the entries a member failed to
//! answer are sent on to the next member.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{TransportError, TransportFailure};
use crate::policy::{Cooldown, CooldownConfig};
use crate::request::{IdAllocator, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{BatchConfig, BatchResponse, HealthStatus, RpcTransport, TransportKind};

/// Latency/stability sampling options for [`RankMode::Scored`].
#[derive(Debug, Clone, PartialEq)]
pub struct RankOptions {
    /// How often every member is probed.
    pub interval: Duration,
    /// Number of past samples the score is computed over.
    pub sample_count: usize,
    pub latency_weight: f64,
    pub stability_weight: f64,
    /// Probe timeout; a timed out probe counts as a failure.
    pub timeout: Duration,
    /// Cheap method used as the probe.
    pub probe_method: String,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            sample_count: 10,
            latency_weight: 0.3,
            stability_weight: 0.7,
            timeout: Duration::from_secs(1),
            probe_method: "net_listening".into(),
        }
    }
}

/// How the preference order of members is maintained.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RankMode {
    /// Configured order; cooling-down members are skipped.
    #[default]
    Ordered,
    /// The last member that succeeded is tried first.
    Stable,
    /// Order is recomputed from periodic probes.
    Scored(RankOptions),
}

/// Configuration for the fallback transport.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Cache partition identity of the combined transport. Derived from the
    /// member keys when unset.
    pub key: Option<String>,
    pub cooldown: CooldownConfig,
    pub rank: RankMode,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            key: None,
            cooldown: CooldownConfig::default(),
            rank: RankMode::Ordered,
        }
    }
}

struct Member {
    transport: Arc<dyn RpcTransport>,
    health: Cooldown,
}

/// Ranked fallback chain with per-member cooldowns.
pub struct FallbackTransport {
    members: Vec<Member>,
    /// Preference order as indices into `members`.
    order: Mutex<Vec<usize>>,
    key: String,
    config: FallbackConfig,
}

impl FallbackTransport {
    /// Build a chain from transports in rank order.
    pub fn new(transports: Vec<Arc<dyn RpcTransport>>, config: FallbackConfig) -> Self {
        let members: Vec<Member> = transports
            .into_iter()
            .map(|t| Member {
                transport: t,
                health: Cooldown::new(config.cooldown.clone()),
            })
            .collect();
        let key = config.key.clone().unwrap_or_else(|| {
            let keys: Vec<&str> = members.iter().map(|m| m.transport.key()).collect();
            format!("fallback({})", keys.join(","))
        });
        let order = (0..members.len()).collect();
        Self {
            members,
            order: Mutex::new(order),
            key,
            config,
        }
    }

    /// Number of transports in the chain.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the chain has no transports.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns `(key, health, consecutive_failures)` per member, in rank order.
    pub fn health_summary(&self) -> Vec<(String, HealthStatus, u32)> {
        self.order
            .lock()
            .iter()
            .map(|&i| {
                let m = &self.members[i];
                let health = if m.health.is_cooling_down() {
                    HealthStatus::Unhealthy
                } else {
                    m.transport.health()
                };
                (
                    m.transport.key().to_string(),
                    health,
                    m.health.consecutive_failures(),
                )
            })
            .collect()
    }

    /// Members to try for the next request.
    ///
    /// Cooling-down members are skipped; if every member is cooling down,
    /// all of them are tried in rank order.
    fn attempt_order(&self) -> Vec<usize> {
        let order = self.order.lock().clone();
        let ready: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| !self.members[i].health.is_cooling_down())
            .collect();
        if ready.is_empty() {
            order
        } else {
            ready
        }
    }

    fn on_success(&self, idx: usize) {
        self.members[idx].health.record_success();
        if self.config.rank == RankMode::Stable {
            let mut order = self.order.lock();
            if let Some(pos) = order.iter().position(|&i| i == idx) {
                let i = order.remove(pos);
                order.insert(0, i);
            }
        }
    }

    /// Demote a member and return the failure to report for it.
    fn on_failure(&self, idx: usize, error: &TransportError) -> TransportFailure {
        let member = &self.members[idx];
        member.health.record_failure();
        tracing::warn!(
            transport = %member.transport.key(),
            error = %error,
            "fallback member failed, trying next"
        );
        self.failure(idx, error)
    }

    fn failure(&self, idx: usize, error: &TransportError) -> TransportFailure {
        TransportFailure {
            transport: self.members[idx].transport.key().to_string(),
            error: error.clone(),
        }
    }

    /// Start the background ranker when the chain is configured with
    /// [`RankMode::Scored`]. The task stops once the chain is dropped.
    pub fn start_ranking(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let RankMode::Scored(options) = self.config.rank.clone() else {
            return None;
        };
        let weak = Arc::downgrade(self);
        Some(tokio::spawn(rank_loop(weak, options)))
    }

    async fn sample(&self, options: &RankOptions, ids: &IdAllocator) -> Vec<Sample> {
        let probes = self.members.iter().map(|m| {
            let req = JsonRpcRequest::new(ids.next_id(), options.probe_method.clone(), vec![]);
            async move {
                let start = Instant::now();
                let ok = matches!(
                    tokio::time::timeout(options.timeout, m.transport.send(req)).await,
                    Ok(Ok(ref resp)) if resp.error.is_none()
                );
                Sample {
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    success: ok,
                }
            }
        });
        futures::future::join_all(probes).await
    }
}

/// One probe result for one member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub latency_ms: f64,
    pub success: bool,
}

/// Order members by `latency_weight * latency_score + stability_weight * stability_score`.
///
/// `rounds` holds one `Vec<Sample>` per probe round, indexed by member.
/// Members that never succeeded score zero. Ties keep configured order.
pub fn rank_by_samples(rounds: &VecDeque<Vec<Sample>>, options: &RankOptions) -> Vec<usize> {
    let Some(first) = rounds.front() else {
        return Vec::new();
    };
    let n = first.len();
    let max_latency = rounds
        .iter()
        .flat_map(|r| r.iter().map(|s| s.latency_ms))
        .fold(0.0_f64, f64::max);

    let mut scores: Vec<(f64, usize)> = (0..n)
        .map(|i| {
            let count = rounds.len() as f64;
            let mean_latency = rounds.iter().map(|r| r[i].latency_ms).sum::<f64>() / count;
            let latency_score = if max_latency > 0.0 {
                1.0 - mean_latency / max_latency
            } else {
                1.0
            };
            let stability_score =
                rounds.iter().filter(|r| r[i].success).count() as f64 / count;
            if stability_score == 0.0 {
                return (0.0, i);
            }
            (
                options.latency_weight * latency_score + options.stability_weight * stability_score,
                i,
            )
        })
        .collect();
    scores.sort_by(|a, b| b.0.total_cmp(&a.0));
    scores.into_iter().map(|(_, i)| i).collect()
}

async fn rank_loop(chain: Weak<FallbackTransport>, options: RankOptions) {
    let ids = IdAllocator::new();
    let mut rounds: VecDeque<Vec<Sample>> = VecDeque::new();
    loop {
        let Some(chain) = chain.upgrade() else { return };
        let round = chain.sample(&options, &ids).await;
        rounds.push_back(round);
        while rounds.len() > options.sample_count.max(1) {
            rounds.pop_front();
        }
        let ranked = rank_by_samples(&rounds, &options);
        tracing::debug!(order = ?ranked, "fallback ranking updated");
        *chain.order.lock() = ranked;
        drop(chain);
        tokio::time::sleep(options.interval).await;
    }
}

#[async_trait]
impl RpcTransport for FallbackTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut failures = Vec::new();
        for idx in self.attempt_order() {
            match self.members[idx].transport.send(req.clone()).await {
                Ok(resp) => {
                    self.on_success(idx);
                    return Ok(resp);
                }
                Err(e) if e.should_reroute() => failures.push(self.on_failure(idx, &e)),
                Err(e) => return Err(e),
            }
        }
        Err(TransportError::AllTransportsFailed(failures))
    }

    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<BatchResponse, TransportError> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        let mut results: Vec<Option<Result<JsonRpcResponse, TransportError>>> =
            reqs.iter().map(|_| None).collect();
        let mut failures: Vec<Vec<TransportFailure>> = reqs.iter().map(|_| Vec::new()).collect();
        // Indices into `reqs` still waiting for an answer.
        let mut remaining: Vec<usize> = (0..reqs.len()).collect();

        for idx in self.attempt_order() {
            if remaining.is_empty() {
                break;
            }
            let batch = remaining.iter().map(|&i| reqs[i].clone()).collect();
            match self.members[idx].transport.send_batch(batch).await {
                Ok(entries) => {
                    let mut entries = entries.into_iter();
                    let mut unanswered = Vec::new();
                    let mut first_error = None;
                    for &i in &remaining {
                        let entry = entries.next().unwrap_or_else(|| {
                            Err(TransportError::MissingResponse { id: reqs[i].id.clone() })
                        });
                        match entry {
                            Err(e) if e.should_reroute() => {
                                failures[i].push(self.failure(idx, &e));
                                first_error.get_or_insert(e);
                                unanswered.push(i);
                            }
                            other => results[i] = Some(other),
                        }
                    }
                    match first_error {
                        Some(e) => {
                            self.on_failure(idx, &e);
                        }
                        None => self.on_success(idx),
                    }
                    remaining = unanswered;
                }
                Err(e) if e.should_reroute() => {
                    let failure = self.on_failure(idx, &e);
                    for &i in &remaining {
                        failures[i].push(failure.clone());
                    }
                }
                Err(e) => {
                    if results.iter().all(Option::is_none) {
                        return Err(e);
                    }
                    for &i in &remaining {
                        results[i] = Some(Err(e.clone()));
                    }
                    remaining.clear();
                }
            }
        }

        // Nothing was answered, so every attempt carried the whole batch.
        if results.iter().all(Option::is_none) {
            let failures = failures.into_iter().next().unwrap_or_default();
            return Err(TransportError::AllTransportsFailed(failures));
        }
        Ok(results
            .into_iter()
            .zip(failures)
            .map(|(result, failures)| {
                result.unwrap_or_else(|| Err(TransportError::AllTransportsFailed(failures)))
            })
            .collect())
    }

    fn health(&self) -> HealthStatus {
        let ready = self
            .members
            .iter()
            .filter(|m| !m.health.is_cooling_down())
            .count();
        match ready {
            0 => HealthStatus::Unhealthy,
            n if n == self.members.len() => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }

    fn url(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    /// Batch window of the member currently ranked first.
    fn batch_config(&self) -> Option<BatchConfig> {
        let first = *self.attempt_order().first()?;
        self.members[first].transport.batch_config()
    }
}
