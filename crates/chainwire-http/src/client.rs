//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Features:
//! - Automatic retry with exponential backoff and jitter for transient errors
//! - True HTTP batching with id-based response correlation
//! - Basic-auth credentials in the URL are sent as an `Authorization` header
//!   (reqwest strips them from the URL)

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use chainwire_core::config::TransportOptions;
use chainwire_core::error::TransportError;
use chainwire_core::policy::{RetryConfig, RetryPolicy};
use chainwire_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainwire_core::transport::{BatchConfig, BatchResponse, HealthStatus, RpcTransport, TransportKind};

use crate::batch;

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    /// Batch window requested from the scheduler; `None` sends one request
    /// per call.
    pub batch: Option<BatchConfig>,
    /// Cache partition identity; defaults to the URL.
    pub key: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(10),
            batch: None,
            key: None,
        }
    }
}

impl HttpClientConfig {
    pub fn from_options(options: &TransportOptions) -> Self {
        let mut config = Self {
            retry: options.retry_config(),
            batch: options.batch_config(),
            key: options.key.clone(),
            ..Self::default()
        };
        if let Some(timeout) = options.timeout() {
            config.request_timeout = timeout;
        }
        config
    }

    /// Like [`from_options`](Self::from_options), but without retries unless
    /// the options ask for them; the fallback chain moves on instead.
    pub fn for_fallback_member(options: &TransportOptions) -> Self {
        Self {
            retry: options.member_retry_config(),
            ..Self::from_options(options)
        }
    }
}

/// Buffered JSON-RPC transport: one HTTP POST per call or per batch.
pub struct HttpRpcClient {
    url: String,
    key: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    request_timeout: Duration,
    batch: Option<BatchConfig>,
    health: Mutex<HealthStatus>,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        let url = url.into();

        Ok(Self {
            key: config.key.unwrap_or_else(|| url.clone()),
            url,
            http,
            retry: RetryPolicy::new(config.retry),
            request_timeout: config.request_timeout,
            batch: config.batch,
            health: Mutex::new(HealthStatus::Unknown),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    fn set_health(&self, status: HealthStatus) {
        *self.health.lock() = status;
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }

    /// POST `body` and return the parsed JSON reply.
    async fn post<B: Serialize + ?Sized + Sync>(&self, body: &B) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::InvalidResponse(format!("body is not JSON: {e}")))
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let body = self.post(req).await?;
        let resp: JsonRpcResponse = serde_json::from_value(body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if resp.id != req.id {
            return Err(TransportError::InvalidResponse(format!(
                "response id {} does not match request id {}",
                resp.id, req.id
            )));
        }
        Ok(resp)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, TransportError>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => {
                    self.set_health(HealthStatus::Healthy);
                    return Ok(v);
                }
                Err(e) if e.is_retryable() => {
                    self.set_health(HealthStatus::Degraded);
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                url = %self.url,
                                what,
                                "retrying request"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            if self.retry.config.max_retries > 0 {
                                tracing::error!(
                                    attempt,
                                    error = %e,
                                    url = %self.url,
                                    what,
                                    "max retries exceeded"
                                );
                            }
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    // Non-retryable (malformed reply, permanent status, node error)
                    if !e.is_execution_error() {
                        self.set_health(HealthStatus::Degraded);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.with_retry(&req.method, || self.send_once(&req)).await
    }

    /// True HTTP batch: send all requests as a JSON array in one HTTP call.
    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<BatchResponse, TransportError> {
        batch::validate(&reqs)?;
        let reqs = &reqs;
        self.with_retry("batch", move || async move {
            let body = self.post(reqs).await?;
            batch::parse_reply(reqs, body)
        })
        .await
    }

    fn health(&self) -> HealthStatus {
        *self.health.lock()
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Buffered
    }

    fn batch_config(&self) -> Option<BatchConfig> {
        self.batch
    }
}
