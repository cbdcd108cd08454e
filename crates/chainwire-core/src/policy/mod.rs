//! Reliability policies applied by transports.
//!
//! ```text
//! Request → [Fallback: Cooldown per member] → [Transport: RetryPolicy] → wire
//! ```

pub mod cooldown;
pub mod retry;

pub use cooldown::{Cooldown, CooldownConfig, CooldownState};
pub use retry::{RetryConfig, RetryPolicy};
