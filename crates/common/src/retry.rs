/*
 * Retry with exponential backoff and jitter.
 *
 * Used for catalog round-trips and storage calls. Only errors the error type
 * classifies as retryable are re-run; conflicts and invalid-state errors fail
 * fast so the caller can apply its own policy.
 */

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{LakeStateError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = only the initial attempt).
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as deterministic jitter (0.0-1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Fail fast, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Profile for catalog round-trips.
    pub fn for_catalog() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.15,
        }
    }

    /// Profile for object-storage operations.
    pub fn for_storage() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Profile for commit submission. Higher jitter so concurrent writers
    /// that conflicted do not re-collide on the same schedule.
    pub fn for_commit() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter_factor: 0.25,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 {
            // Deterministic low-discrepancy jitter keyed by attempt number.
            let phase = (attempt as f64 * 0.618033988749895) % 1.0;
            capped * self.jitter_factor * phase
        } else {
            0.0
        };

        Duration::from_secs_f64(capped + jitter)
    }
}

/// Runs an async operation, retrying retryable failures per `config`.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("operation succeeded on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => {
                let remaining = config.max_retries.saturating_sub(attempt);
                if !e.is_retryable() || remaining == 0 {
                    if !e.is_retryable() {
                        debug!("non-retryable error: {}", e);
                    } else {
                        warn!("all {} retries exhausted: {}", config.max_retries, e);
                    }
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "attempt {} failed ({} remaining), retrying in {:?}: {}",
                    attempt + 1,
                    remaining,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| LakeStateError::Unexpected("retry loop exited without result".into())))
}
