// src/pool/retry.rs
//! Retry policy and backoff
//!
//! One exponential-backoff curve serves both task retries and unit
//! restarts: `min(cap, base * 2^attempt)`. The non-retryable pattern set
//! matches errors no second attempt can fix.

use crate::utils::config::PoolConfig;
use std::time::Duration;

/// Error messages that are never retried, matched case-insensitively
pub const NON_RETRYABLE_PATTERNS: [&str; 4] = [
    "invalid input",
    "unsupported format",
    "file too large",
    "out of memory",
];

/// True when the message matches a non-retryable pattern
pub fn is_non_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Shared retry/backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Decide whether a failed attempt gets another try
    pub fn should_retry(&self, retry_count: u32, cancelled: bool, fatal: bool, message: &str) -> bool {
        if cancelled || fatal {
            return false;
        }
        if is_non_retryable_message(message) {
            return false;
        }
        retry_count < self.max_retries
    }

    /// Delay before attempt `attempt` (0-based): `min(cap, base * 2^attempt)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(31);
        let millis = (self.base_delay.as_millis() as u64)
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
