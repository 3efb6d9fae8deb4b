//! Executor configuration

use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the executor does with an item whose generation failed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Write a result carrying the error and continue with the next item
    #[default]
    Record,
    /// Fail the whole run
    Abort,
}

/// Run executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Pause between items (0 still yields to the runtime)
    pub item_delay_ms: u64,
    /// Per-attempt generation timeout
    pub item_timeout_ms: u64,
    /// Extra attempts for retryable generation errors
    pub max_retries: u32,
    /// Base backoff between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
    /// Handling of terminal per-item failures
    pub failure_policy: FailurePolicy,
    /// Aggregate metrics as soon as a run completes
    pub auto_metrics: bool,
}

impl ExecutorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With inter-item delay
    #[inline]
    #[must_use]
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay_ms = duration_ms(delay);
        self
    }

    /// With per-attempt timeout
    #[inline]
    #[must_use]
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_ms = duration_ms(timeout);
        self
    }

    /// With retry budget and base backoff
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = duration_ms(backoff);
        self
    }

    /// With failure policy
    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// With automatic metrics on completion
    #[inline]
    #[must_use]
    pub fn with_auto_metrics(mut self, enabled: bool) -> Self {
        self.auto_metrics = enabled;
        self
    }

    /// Inter-item delay
    #[inline]
    #[must_use]
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    /// Per-attempt timeout
    #[inline]
    #[must_use]
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    #[inline]
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Reject values the executor cannot work with
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.item_timeout_ms == 0 {
            return Err(EvalError::Config(
                "executor.item_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            item_delay_ms: 0,
            item_timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 250,
            failure_policy: FailurePolicy::Record,
            auto_metrics: false,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
