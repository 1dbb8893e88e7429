//! Bounded retries with exponential backoff and per-attempt timeouts.
//!
//! Every call to an external service goes through [`with_retry`]: each
//! attempt is raced against a timeout, retryable failures back off
//! `base, 2×base, 4×base, …` (capped at `max_delay`), and the last error
//! is returned once `max_retries` retries are spent. Non-retryable errors
//! return immediately.
//!
//! Dropping the returned future cancels the in-flight attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use docqa_core::error::{EmbeddingServiceError, GenerationServiceError, IndexServiceError};
use tracing::warn;

use crate::config::RetryConfig;

/// Service errors [`with_retry`] knows how to classify.
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;
    /// Error for an attempt that hit the per-attempt timeout.
    fn timed_out() -> Self;
}

impl Retryable for EmbeddingServiceError {
    fn is_retryable(&self) -> bool {
        EmbeddingServiceError::is_retryable(self)
    }
    fn timed_out() -> Self {
        EmbeddingServiceError::Timeout
    }
}

impl Retryable for IndexServiceError {
    fn is_retryable(&self) -> bool {
        IndexServiceError::is_retryable(self)
    }
    fn timed_out() -> Self {
        IndexServiceError::Timeout
    }
}

impl Retryable for GenerationServiceError {
    fn is_retryable(&self) -> bool {
        GenerationServiceError::is_retryable(self)
    }
    fn timed_out() -> Self {
        GenerationServiceError::Timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, timeout_secs: u64) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// No retries, only the timeout.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            timeout,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => E::timed_out(),
        };
        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        let delay = policy.backoff(attempt);
        warn!(
            op = what,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}
