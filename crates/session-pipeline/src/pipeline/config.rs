//! Run-wide configuration for pipeline execution.
//!
//! Controls concurrency, default timeouts and retries, and the event buffer.
//! Settings configured on an individual task take precedence.

use super::PipelineError;
use crate::task::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_event_buffer() -> usize {
    PipelineConfig::DEFAULT_EVENT_BUFFER
}

/// Configuration for a pipeline run.
///
/// # Examples
///
/// ```
/// use session_pipeline::pipeline::PipelineConfig;
/// use std::time::Duration;
///
/// let config = PipelineConfig::new()
///     .with_max_concurrent_tasks(4)
///     .with_default_task_timeout(Duration::from_secs(120));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of parallel-group members executing at once.
    ///
    /// If `None`, every member of a group starts immediately.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,

    /// Per-attempt timeout for tasks that do not set their own.
    ///
    /// If `None`, no timeout is applied.
    #[serde(default)]
    pub default_task_timeout: Option<Duration>,

    /// Retry policy for tasks that do not set their own.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Capacity of the fragment channel.
    ///
    /// Emitting tasks wait while this many fragments are unconsumed.
    ///
    /// **Default:** 64
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    pub const DEFAULT_EVENT_BUFFER: usize = 64;

    /// Creates a new configuration with default values.
    ///
    /// Default values:
    /// - `max_concurrent_tasks`: `None` (unlimited)
    /// - `default_task_timeout`: `None` (no timeout)
    /// - `default_retry`: [`RetryPolicy::default`]
    /// - `event_buffer`: 64
    pub fn new() -> Self {
        Self {
            max_concurrent_tasks: None,
            default_task_timeout: None,
            default_retry: RetryPolicy::default(),
            event_buffer: Self::DEFAULT_EVENT_BUFFER,
        }
    }

    /// Parses and validates a configuration from JSON.
    ///
    /// Missing fields take their default values. Durations use serde's
    /// `{"secs": .., "nanos": ..}` form.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive a run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrent_tasks == Some(0) {
            return Err(PipelineError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(PipelineError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.default_task_timeout == Some(Duration::ZERO) {
            return Err(PipelineError::Config(
                "default_task_timeout must be greater than zero".to_string(),
            ));
        }
        let multiplier = self.default_retry.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(PipelineError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.default_retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    /// Removes the concurrency limit.
    pub fn with_unlimited_concurrency(mut self) -> Self {
        self.max_concurrent_tasks = None;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = Some(timeout);
        self
    }

    /// Removes the default task timeout.
    pub fn with_no_timeout(mut self) -> Self {
        self.default_task_timeout = None;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }
}
