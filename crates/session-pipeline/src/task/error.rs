//! Error types for task execution.
//!
//! Backends, hooks and tools report failures with the enums below. None of
//! them ever escapes a pipeline run: the task converts whatever ends its
//! execution into a [`TaskFailure`] record that is committed under the
//! task's output key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by an execution backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// A failure that may succeed on retry (throttling, connection reset, ...).
    #[error("Transient execution error: {0}")]
    Transient(String),

    /// A failure that will not be resolved by retrying (invalid input shape, ...).
    #[error("Fatal execution error: {0}")]
    Fatal(String),

    /// A single attempt exceeded the task's timeout.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Check if this error should trigger an automatic retry.
    ///
    /// Timeouts go through the same path as any other transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors raised by a pre-execution hook. They abort only the task the hook
/// is attached to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    /// The hook refused to let the task run.
    #[error("Hook '{hook}' rejected task: {reason}")]
    Rejected { hook: String, reason: String },

    /// Declared inputs required by the task were absent from the snapshot.
    #[error("Missing required input(s): {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    /// An artifact could not be loaded for attachment.
    #[error("Failed to load artifact '{path}': {reason}")]
    Artifact { path: String, reason: String },

    /// A template (instruction or path) failed to render.
    #[error("Template error: {0}")]
    Template(String),
}

impl HookError {
    /// Creates a rejection error attributed to the named hook.
    pub fn rejected(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            hook: hook.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by tool collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No tool with this name is registered for the task.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// The arguments did not match what the tool expects.
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool (or the service behind it) is temporarily unavailable.
    #[error("Tool '{tool}' unavailable: {reason}")]
    Unavailable { tool: String, reason: String },

    /// The tool ran and failed.
    #[error("Tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },
}

impl From<ToolError> for ExecutionError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Unavailable { .. } => ExecutionError::Transient(err.to_string()),
            other => ExecutionError::Fatal(other.to_string()),
        }
    }
}

/// Classification of a committed failure record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A pre-execution hook aborted the task.
    Hook,
    /// The backend failed fatally, or transient failures exhausted the retry bound.
    Fatal,
    /// The run was cancelled while the task was active.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Hook => "hook",
            FailureKind::Fatal => "fatal",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The typed error value committed in place of a task's normal output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name of the task that failed.
    pub task: String,
    /// What ended the task.
    pub kind: FailureKind,
    /// Human readable description.
    pub message: String,
    /// Number of backend invocations made (0 when the task never reached execute).
    pub attempts: u32,
}

impl TaskFailure {
    /// A hook aborted the task before execution.
    pub fn hook(task: impl Into<String>, error: &HookError) -> Self {
        Self {
            task: task.into(),
            kind: FailureKind::Hook,
            message: error.to_string(),
            attempts: 0,
        }
    }

    /// The task failed fatally after `attempts` invocations.
    pub fn fatal(task: impl Into<String>, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            task: task.into(),
            kind: FailureKind::Fatal,
            message: message.into(),
            attempts,
        }
    }

    /// The task was cancelled.
    pub fn cancelled(task: impl Into<String>, attempts: u32) -> Self {
        let task = task.into();
        Self {
            message: format!("Task '{}' was cancelled", task),
            task,
            kind: FailureKind::Cancelled,
            attempts,
        }
    }

    /// Returns true if this record stems from cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.task, self.message)
    }
}
