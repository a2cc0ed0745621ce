//! Retry policy and backoff arithmetic.

use serde::{Deserialize, Serialize};

/// Default cap on a single backoff delay when the config does not override.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Linear,
    Exponential,
}

/// Per-action retry policy.
///
/// `retries` is the number of retries after the first attempt, so an action
/// makes at most `retries + 1` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: BackoffKind::Linear,
            delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay before retry `attempt` (1-indexed), capped at `max_delay_ms`.
    ///
    /// - linear: `attempt * delay_ms`
    /// - exponential: `delay_ms * 2^(attempt - 1)`
    pub fn delay_for_attempt(&self, attempt: u32, max_delay_ms: u64) -> u64 {
        if attempt == 0 || self.delay_ms == 0 {
            return 0;
        }
        let raw = match self.backoff {
            BackoffKind::Linear => self.delay_ms.saturating_mul(attempt as u64),
            BackoffKind::Exponential => {
                let shift = (attempt - 1).min(63);
                self.delay_ms.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX))
            }
        };
        raw.min(max_delay_ms)
    }
}
