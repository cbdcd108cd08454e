//! Per-transport health used by the fallback combinator.
//!
//! State transitions:
//! - `Ready` → `CoolingDown`: a rerouteable failure is recorded
//! - `CoolingDown` → `Ready`: the cooldown window elapses, or a success is recorded
//!
//! Unlike a circuit breaker there is no half-open probe: once the window
//! has passed the transport simply regains its configured rank.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Ready,
    CoolingDown,
}

impl std::fmt::Display for CooldownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::CoolingDown => write!(f, "cooling-down"),
        }
    }
}

/// Configuration for the cooldown tracker.
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// How long a failed transport is demoted.
    pub cooldown: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
        }
    }
}

struct HealthInner {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// Thread-safe `{consecutive_failures, cooldown_until}` record.
#[derive(Clone)]
pub struct Cooldown {
    config: CooldownConfig,
    inner: Arc<Mutex<HealthInner>>,
}

impl Cooldown {
    /// Create a new tracker in `Ready` state.
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HealthInner {
                consecutive_failures: 0,
                cooldown_until: None,
            })),
        }
    }

    pub fn state(&self) -> CooldownState {
        let inner = self.inner.lock();
        match inner.cooldown_until {
            Some(until) if Instant::now() < until => CooldownState::CoolingDown,
            _ => CooldownState::Ready,
        }
    }

    /// Returns `true` while `now < cooldown_until`.
    pub fn is_cooling_down(&self) -> bool {
        self.state() == CooldownState::CoolingDown
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Record a successful request; restores rank immediately.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.consecutive_failures > 0 {
            tracing::info!(
                failures = inner.consecutive_failures,
                "transport recovered"
            );
        }
        inner.consecutive_failures = 0;
        inner.cooldown_until = None;
    }

    /// Record a failed request and start (or extend) the cooldown window.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.cooldown_until = Some(Instant::now() + self.config.cooldown);
        tracing::warn!(
            failures = inner.consecutive_failures,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "transport demoted"
        );
    }
}

impl std::fmt::Debug for Cooldown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cooldown")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}
