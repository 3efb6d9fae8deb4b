//! Response generation seam
//!
//! The executor asks a [`ResponseGenerator`] for one completion per dataset
//! item. [`MockGenerator`] produces deterministic canned text and is the
//! default backend for the `mock` provider kind.

use crate::error::GenerationError;
use crate::types::{Generation, GenerationRequest};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Produces model output for one input
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate a completion for `request.input` with `request.model_id`
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

/// Deterministic generator with a fixed simulated latency
#[derive(Debug, Clone)]
pub struct MockGenerator {
    latency: Duration,
}

impl MockGenerator {
    /// Create mock with simulated latency
    #[inline]
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    /// Mock that answers immediately
    #[inline]
    #[must_use]
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl ResponseGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let start = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let output = format!(
            "Mock response from {} for: {}",
            request.model_id, request.input
        );
        let token_count = count_tokens(&request.input) + count_tokens(&output);

        Ok(Generation {
            output,
            latency_ms: elapsed_ms(start),
            token_count: Some(token_count),
        })
    }
}

/// Whitespace token estimate, used when a provider reports no usage
#[inline]
#[must_use]
pub fn count_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Milliseconds since `start`, saturating
#[inline]
#[must_use]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
