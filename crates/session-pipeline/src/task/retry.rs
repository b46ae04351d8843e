//! Retry, backoff and timeout handling for task execution.
//!
//! [`execute_with_retry`] drives one task's backend invocations:
//! - Each attempt is bounded by the task timeout (when set)
//! - Only errors marked as retryable are retried
//! - Retries back off exponentially, capped, with optional jitter
//! - Cancellation wins over every other branch

use super::ExecutionError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry configuration for a task.
///
/// # Examples
///
/// ```
/// use session_pipeline::task::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_max_retries(4)
///     .with_backoff(Duration::from_millis(100), Duration::from_secs(2))
///     .without_jitter();
///
/// assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not including the first attempt).
    ///
    /// **Default:** 2 (initial attempt + 2 retries)
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Growth factor applied per retry.
    pub multiplier: f64,

    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    ///
    /// - `max_retries`: 2
    /// - `initial_backoff`: 200ms
    /// - `max_backoff`: 5s
    /// - `multiplier`: 2.0
    /// - `jitter`: enabled
    pub fn new() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::new()
        }
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial and maximum backoff.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the backoff growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if base.is_finite() && base < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(base.max(0.0))
        } else {
            self.max_backoff
        };

        if self.jitter && !capped.is_zero() {
            capped.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            capped
        }
    }
}

/// Terminal result of [`execute_with_retry`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded.
    Succeeded { value: T, attempts: u32 },
    /// Execution failed for good.
    ///
    /// `exhausted` is true when the last error was retryable but the retry
    /// bound was reached.
    Failed {
        error: ExecutionError,
        attempts: u32,
        exhausted: bool,
    },
    /// The cancellation token fired first.
    Cancelled { attempts: u32 },
}

/// Executes an operation with timeout, retry and cancellation handling.
///
/// `operation` receives the 1-based attempt number.
///
/// # Examples
///
/// ```rust,ignore
/// let outcome = execute_with_retry(&policy, Some(timeout), &cancel, |attempt| {
///     backend.invoke(Invocation {
///         envelope: &envelope,
///         tools: &tools,
///         emitter: &emitter,
///         attempt,
///     })
/// })
/// .await;
/// ```
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    operation: F,
) -> RetryOutcome<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, ExecutionError>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let attempt = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, operation(attempts)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Timeout(limit)),
                },
                None => operation(attempts).await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
            result = attempt => result,
        };

        match result {
            Ok(value) => {
                if attempts > 1 {
                    info!(
                        attempt = attempts,
                        max_attempts = policy.max_retries + 1,
                        "Operation succeeded after retry"
                    );
                }
                return RetryOutcome::Succeeded { value, attempts };
            }
            Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                let delay = policy.backoff_for(attempts);
                warn!(
                    attempt = attempts,
                    max_attempts = policy.max_retries + 1,
                    error = %e,
                    delay = ?delay,
                    "Operation failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                let exhausted = e.is_retryable();
                if exhausted {
                    warn!(attempts, error = %e, "Operation failed, retries exhausted");
                } else {
                    warn!(attempts, error = %e, "Operation failed with non-retryable error");
                }
                return RetryOutcome::Failed {
                    error: e,
                    attempts,
                    exhausted,
                };
            }
        }
    }
}
