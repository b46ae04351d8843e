//! Concurrent execution of a parallel group's members.

use super::RunContext;
use crate::state::StateSnapshot;
use crate::task::{Task, TaskFailure, TaskOutcome, TaskReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{Instrument, info_span, warn};

/// Tasks that run concurrently against one shared snapshot.
///
/// Members cannot see each other's outputs; all of their writes are
/// committed together once every member has resolved.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    name: String,
    members: Vec<Arc<Task>>,
}

impl ParallelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Adds a member.
    pub fn with_task(mut self, task: Task) -> Self {
        self.members.push(Arc::new(task));
        self
    }

    /// Adds a member shared with another definition.
    pub fn with_shared_task(mut self, task: Arc<Task>) -> Self {
        self.members.push(task);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in declaration order.
    pub fn members(&self) -> &[Arc<Task>] {
        &self.members
    }

    /// Runs every member and waits until all of them are terminal.
    ///
    /// Reports come back in declaration order. A member that fails, or even
    /// panics, produces a failure report without disturbing its siblings.
    pub async fn run(&self, snapshot: &StateSnapshot, ctx: &RunContext) -> Vec<TaskReport> {
        run_members(&self.name, &self.members, snapshot, ctx).await
    }
}

/// Spawns one tokio task per member against the same snapshot.
///
/// Sequential stages go through here too, with a single member, so a panic
/// never takes down the run.
pub(super) async fn run_members(
    stage: &str,
    members: &[Arc<Task>],
    snapshot: &StateSnapshot,
    ctx: &RunContext,
) -> Vec<TaskReport> {
    let limit = ctx
        .max_concurrent_tasks
        .map(|max| Arc::new(Semaphore::new(max)));

    let mut handles = Vec::with_capacity(members.len());
    for member in members {
        let task = Arc::clone(member);
        let snapshot = snapshot.clone();
        let task_ctx = ctx.task.clone();
        let limit = limit.clone();

        let task_span = info_span!(
            "task",
            task = %task.name(),
            output_key = %task.output_key(),
            stage = %stage,
        );

        let handle = tokio::spawn(
            async move {
                let _permit = match limit {
                    Some(semaphore) => tokio::select! {
                        biased;
                        // Task::run reports the cancellation itself.
                        _ = task_ctx.cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                task.run(&snapshot, &task_ctx).await
            }
            .instrument(task_span),
        );

        handles.push((Arc::clone(member), handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (task, handle) in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => {
                let message = if e.is_panic() {
                    format!("Task panicked: {}", e)
                } else {
                    format!("Task aborted: {}", e)
                };
                warn!(task = %task.name(), stage = %stage, error = %message, "Task did not finish");
                reports.push(TaskReport {
                    task: task.name().to_string(),
                    output_key: task.output_key().to_string(),
                    outcome: TaskOutcome::Failed(TaskFailure::fatal(task.name(), message, 0)),
                    attempts: 0,
                    elapsed: Duration::ZERO,
                });
            }
        }
    }

    reports
}
