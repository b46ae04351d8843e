use thiserror::Error;

/// Errors raised while building a pipeline or reading a run's results.
///
/// Nothing that happens inside a running task surfaces here; task failures
/// are committed to session state as [`TaskFailure`](crate::task::TaskFailure)
/// records instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline '{0}' has no stages")]
    EmptyPipeline(String),

    #[error("Parallel group '{0}' has no members")]
    EmptyGroup(String),

    #[error("Task name '{0}' is used more than once")]
    DuplicateTask(String),

    #[error("Output key '{key}' is written by both '{first}' and '{second}'")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid template: {0}")]
    Template(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Final results were requested before the event stream ended.
    #[error("The event stream has not been drained yet")]
    NotDrained,

    /// The run's driver stopped without recording its final state.
    #[error("The pipeline run ended without producing a final state")]
    RunAborted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
