//! Pipeline definition and stage-by-stage execution.
//!
//! A [`SequentialPipeline`] is an ordered list of [`Stage`]s. Each stage is
//! either one task or a [`ParallelGroup`]. Execution follows the
//! snapshot-read / single-writer-commit discipline:
//!
//! ```text
//! for each stage:
//!     snapshot = state.snapshot()        // immutable, shared by all members
//!     reports  = stage.run(snapshot)     // members never write state
//!     state.commit(writes(reports))      // one atomic commit per stage
//! ```
//!
//! Stage *i+1* only starts after stage *i* has committed, so it sees every
//! key written before it. A failed task commits its failure record and the
//! pipeline carries on; downstream tasks read that key as absent.

mod config;
mod error;
pub mod journal;
mod parallel;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use journal::{RunReport, RunStatus, TaskRecord};
pub use parallel::ParallelGroup;

use crate::events::FragmentEmitter;
use crate::state::SessionState;
use crate::state::StateSnapshot;
use crate::task::{Task, TaskContext, TaskReport, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// One step of a pipeline.
#[derive(Debug, Clone)]
pub enum Stage {
    Task(Arc<Task>),
    Parallel(ParallelGroup),
}

impl Stage {
    /// The task's name, or the group's.
    pub fn name(&self) -> &str {
        match self {
            Stage::Task(task) => task.name(),
            Stage::Parallel(group) => group.name(),
        }
    }

    /// Every task in the stage, in declaration order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        match self {
            Stage::Task(task) => std::slice::from_ref(task),
            Stage::Parallel(group) => group.members(),
        }
    }

    /// Runs the stage against `snapshot` without committing anything.
    pub async fn run(&self, snapshot: &StateSnapshot, ctx: &RunContext) -> Vec<TaskReport> {
        match self {
            Stage::Task(task) => {
                parallel::run_members(task.name(), std::slice::from_ref(task), snapshot, ctx)
                    .await
            }
            Stage::Parallel(group) => group.run(snapshot, ctx).await,
        }
    }
}

impl From<Task> for Stage {
    fn from(task: Task) -> Self {
        Stage::Task(Arc::new(task))
    }
}

impl From<ParallelGroup> for Stage {
    fn from(group: ParallelGroup) -> Self {
        Stage::Parallel(group)
    }
}

/// Run-scoped execution settings shared by every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Settings each task executes under.
    pub task: TaskContext,
    /// Cap on concurrently executing group members.
    pub max_concurrent_tasks: Option<usize>,
}

impl RunContext {
    pub fn new(emitter: FragmentEmitter, config: &PipelineConfig) -> Self {
        let mut task = TaskContext::new(emitter).with_retry(config.default_retry.clone());
        task.timeout = config.default_task_timeout;
        Self {
            task,
            max_concurrent_tasks: config.max_concurrent_tasks,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.task.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.task.cancel
    }
}

/// Final state and journal of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub state: SessionState,
    pub report: RunReport,
}

/// An ordered list of stages, validated at construction.
///
/// # Examples
///
/// ```rust,ignore
/// let pipeline = SequentialPipeline::builder("stock_research")
///     .parallel(
///         ParallelGroup::new("research")
///             .with_task(technical)
///             .with_task(fundamental),
///     )
///     .task(summary)
///     .task(visualization)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct SequentialPipeline {
    name: String,
    stages: Vec<Stage>,
}

impl SequentialPipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Total number of tasks across all stages.
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks().len()).sum()
    }

    /// Runs every stage in order, committing after each one.
    ///
    /// Stops before the next stage once the context's token is cancelled;
    /// tasks of stages that never started are journaled as not started and
    /// their output keys stay absent.
    pub async fn run(&self, mut state: SessionState, ctx: &RunContext) -> PipelineOutcome {
        let mut report = RunReport::new(state.session_id());

        for (index, stage) in self.stages.iter().enumerate() {
            if ctx.cancellation_token().is_cancelled() {
                warn!(
                    stage = %stage.name(),
                    remaining = self.stages.len() - index,
                    "Run cancelled, remaining stages not started"
                );
                for pending in &self.stages[index..] {
                    for task in pending.tasks() {
                        report.record(TaskRecord::not_started(
                            pending.name(),
                            task.name(),
                            task.output_key(),
                        ));
                    }
                }
                break;
            }

            let stage_span = info_span!(
                "stage",
                stage = %stage.name(),
                index = index,
                tasks = stage.tasks().len(),
            );

            let snapshot = state.snapshot();
            let reports = stage
                .run(&snapshot, ctx)
                .instrument(stage_span.clone())
                .await;

            state.commit(reports.iter().map(TaskReport::write).collect());

            let failed = reports
                .iter()
                .filter(|r| !matches!(r.status(), TaskStatus::Succeeded | TaskStatus::Skipped))
                .count();
            stage_span.in_scope(|| {
                info!(
                    committed = reports.len(),
                    failed = failed,
                    "Stage committed"
                );
            });

            for task_report in &reports {
                report.record(TaskRecord::from_report(stage.name(), task_report));
            }
        }

        if report
            .records
            .iter()
            .any(|r| matches!(r.status, TaskStatus::Cancelled | TaskStatus::NotStarted))
        {
            report.status = RunStatus::Cancelled;
        }

        PipelineOutcome { state, report }
    }
}

/// Builder for [`SequentialPipeline`].
#[derive(Debug)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Appends a single-task stage.
    pub fn task(self, task: Task) -> Self {
        self.stage(Stage::from(task))
    }

    /// Appends a parallel stage.
    pub fn parallel(self, group: ParallelGroup) -> Self {
        self.stage(Stage::Parallel(group))
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates the definition.
    ///
    /// Requires at least one stage, non-empty groups, unique task names and
    /// one writer per output key.
    pub fn build(self) -> Result<SequentialPipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::EmptyPipeline(self.name));
        }

        let mut names = HashSet::new();
        let mut writers: HashMap<&str, &str> = HashMap::new();
        for stage in &self.stages {
            if let Stage::Parallel(group) = stage {
                if group.members().is_empty() {
                    return Err(PipelineError::EmptyGroup(group.name().to_string()));
                }
            }

            for task in stage.tasks() {
                if !names.insert(task.name()) {
                    return Err(PipelineError::DuplicateTask(task.name().to_string()));
                }
                if let Some(first) = writers.insert(task.output_key(), task.name()) {
                    return Err(PipelineError::DuplicateOutputKey {
                        key: task.output_key().to_string(),
                        first: first.to_string(),
                        second: task.name().to_string(),
                    });
                }
            }
        }

        Ok(SequentialPipeline {
            name: self.name,
            stages: self.stages,
        })
    }
}
