//! Serde option records for building transports from JSON.
//!
//! Keys are camelCase:
//!
//! ```json
//! {
//!   "transports": [
//!     { "url": "https://rpc.example.com", "retryCount": 2, "batch": { "wait": 10, "maxSize": 50 } },
//!     { "url": "wss://ws.example.com", "timeoutMs": 5000 },
//!     { "path": "/tmp/geth.ipc" }
//!   ],
//!   "cooldownMs": 30000,
//!   "rank": "stable"
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fallback::{FallbackConfig, RankMode, RankOptions};
use crate::policy::{CooldownConfig, RetryConfig};
use crate::socket::SocketConfig;
use crate::transport::BatchConfig;

/// Invalid transport configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("transport needs exactly one of `url` or `path`")]
    MissingEndpoint,

    #[error("unsupported URL scheme in {0}")]
    UnsupportedScheme(String),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("fallback needs at least one transport")]
    EmptyFallback,

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where a transport connects to, derived from `url` / `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Http(String),
    Ws(String),
    Ipc(PathBuf),
}

/// `batch: true | false | { wait, maxSize }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchOption {
    Enabled(bool),
    Window(BatchWindowOptions),
}

impl Default for BatchOption {
    fn default() -> Self {
        Self::Enabled(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWindowOptions {
    /// Milliseconds the window stays open.
    #[serde(default)]
    pub wait: u64,
    #[serde(default)]
    pub max_size: Option<usize>,
}

/// Options for one concrete transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Retries (HTTP) or reconnect attempts (sockets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Base delay of the exponential backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub batch: BatchOption,
    /// Cache partition identity; defaults to the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl TransportOptions {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Classify the endpoint. A `url` without a known scheme is taken as an
    /// IPC socket path.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        match (&self.url, &self.path) {
            (Some(url), None) => {
                let lower = url.to_ascii_lowercase();
                if lower.starts_with("http://") || lower.starts_with("https://") {
                    Ok(Endpoint::Http(url.clone()))
                } else if lower.starts_with("ws://") || lower.starts_with("wss://") {
                    Ok(Endpoint::Ws(url.clone()))
                } else if lower.contains("://") {
                    Err(ConfigError::UnsupportedScheme(url.clone()))
                } else {
                    Ok(Endpoint::Ipc(PathBuf::from(url)))
                }
            }
            (None, Some(path)) => Ok(Endpoint::Ipc(path.clone())),
            _ => Err(ConfigError::MissingEndpoint),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::NotPositive("timeoutMs"));
        }
        if let BatchOption::Window(BatchWindowOptions {
            max_size: Some(0), ..
        }) = self.batch
        {
            return Err(ConfigError::NotPositive("batch.maxSize"));
        }
        self.endpoint().map(|_| ())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Retry policy for buffered transports.
    pub fn retry_config(&self) -> RetryConfig {
        let mut config = RetryConfig::default();
        if let Some(n) = self.retry_count {
            config.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.initial_backoff = Duration::from_millis(ms);
        }
        config
    }

    /// Retry settings for a member of a fallback chain. Failing over to the
    /// next member replaces retrying unless `retryCount` is set explicitly.
    pub fn member_retry_config(&self) -> RetryConfig {
        match self.retry_count {
            Some(_) => self.retry_config(),
            None => RetryConfig::disabled(),
        }
    }

    pub fn batch_config(&self) -> Option<BatchConfig> {
        match &self.batch {
            BatchOption::Enabled(false) => None,
            BatchOption::Enabled(true) => Some(BatchConfig::default()),
            BatchOption::Window(w) => Some(BatchConfig {
                wait: Duration::from_millis(w.wait),
                max_size: w.max_size.unwrap_or(BatchConfig::default().max_size),
            }),
        }
    }

    /// Settings for socket transports; retry options drive reconnects.
    pub fn socket_config(&self) -> SocketConfig {
        let mut config = SocketConfig {
            key: self.key.clone(),
            ..SocketConfig::default()
        };
        if let Some(timeout) = self.timeout() {
            config.request_timeout = timeout;
        }
        if let Some(n) = self.retry_count {
            config.reconnect_attempts = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        config
    }
}

/// `rank: "ordered" | "stable" | "scored"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankOption {
    #[default]
    Ordered,
    Stable,
    Scored,
}

/// Options for a fallback chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackOptions {
    /// Members in rank order.
    pub transports: Vec<TransportOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub rank: RankOption,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl FallbackOptions {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transports.is_empty() {
            return Err(ConfigError::EmptyFallback);
        }
        self.transports.iter().try_for_each(TransportOptions::validate)
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        let mut config = FallbackConfig {
            key: self.key.clone(),
            ..Default::default()
        };
        if let Some(ms) = self.cooldown_ms {
            config.cooldown = CooldownConfig {
                cooldown: Duration::from_millis(ms),
            };
        }
        config.rank = match self.rank {
            RankOption::Ordered => RankMode::Ordered,
            RankOption::Stable => RankMode::Stable,
            RankOption::Scored => RankMode::Scored(RankOptions::default()),
        };
        config
    }
}
