use serde::{Deserialize, Serialize};

/// Configuration for automatic write-conflict retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Whether a write conflict consumes another attempt instead of failing.
    pub retry_write_conflicts: bool,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_write_conflicts: true,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, without sleeping between attempts.
    pub fn immediate() -> Self {
        Self {
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff in milliseconds before attempt `attempt + 1`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if self.base_backoff_ms == 0 {
            return 0;
        }
        let cap = self.max_backoff_ms.max(self.base_backoff_ms);

        let mut backoff = self.base_backoff_ms;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}
