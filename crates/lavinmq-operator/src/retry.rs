//! Bounded retry on optimistic-concurrency conflicts.
//!
//! Child objects are written with the resourceVersion they were read at, so
//! a concurrent writer makes the API server answer 409. The whole
//! fetch-diff-write sequence is re-run from a fresh read in that case. Any
//! other error is returned to the caller immediately.
//!
//! # Example
//!
//! ```ignore
//! use lavinmq_operator::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::default(), "configmap", || async {
//!     let existing = store.get::<ConfigMap>("broker").await?;
//!     // diff and replace
//!     Ok(())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry budget for conflicting writes
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Run `operation`, re-running it on write conflicts until it succeeds,
/// fails with a non-conflict error, or the attempt budget is spent.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(e) => {
                metrics::counter!("lavinmq_operator_write_conflicts_total").increment(1);

                if attempt >= config.max_attempts.max(1) {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Write conflict persisted after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = jittered_delay.as_millis(),
                    "Write conflict, retrying from a fresh read"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
