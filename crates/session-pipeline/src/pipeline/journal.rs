use crate::task::{TaskReport, TaskStatus};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage resolved and committed.
    Completed,
    /// Cancellation stopped the run before its last stage committed.
    Cancelled,
}

/// Snapshot of a single task's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    /// Name of the stage (the task itself, or its group).
    pub stage: String,
    pub output_key: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub recorded_at_ms: u64,
}

impl TaskRecord {
    /// Builds a record from a resolved task.
    pub fn from_report(stage: &str, report: &TaskReport) -> Self {
        Self {
            task: report.task.clone(),
            stage: stage.to_string(),
            output_key: report.output_key.clone(),
            status: report.status(),
            attempts: report.attempts,
            elapsed_ms: report.elapsed.as_millis() as u64,
            error: report.outcome.failure().map(|f| f.message.clone()),
            recorded_at_ms: current_timestamp_ms(),
        }
    }

    /// Record for a task whose stage never started.
    pub fn not_started(stage: &str, task: &str, output_key: &str) -> Self {
        Self {
            task: task.to_string(),
            stage: stage.to_string(),
            output_key: output_key.to_string(),
            status: TaskStatus::NotStarted,
            attempts: 0,
            elapsed_ms: 0,
            error: None,
            recorded_at_ms: current_timestamp_ms(),
        }
    }
}

/// Per-task outcomes of a run, in stage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: String,
    pub status: RunStatus,
    pub records: Vec<TaskRecord>,
}

impl RunReport {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: RunStatus::Completed,
            records: Vec::new(),
        }
    }

    /// Appends a record.
    pub fn record(&mut self, record: TaskRecord) {
        self.records.push(record);
    }

    pub fn get(&self, task: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.task == task)
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.get(task).map(|r| r.status)
    }

    /// Records of tasks that committed a failure (cancellations included).
    pub fn failures(&self) -> Vec<&TaskRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .collect()
    }
}

/// Returns the current system time in milliseconds since UNIX_EPOCH.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFailure, TaskOutcome};
    use serde_json::json;
    use std::time::Duration;

    fn report(task: &str, outcome: TaskOutcome, attempts: u32) -> TaskReport {
        TaskReport {
            task: task.to_string(),
            output_key: format!("{}_out", task),
            outcome,
            attempts,
            elapsed: Duration::from_millis(12),
        }
    }

    #[test]
    fn test_records_and_lookup() {
        let mut journal = RunReport::new("session_1");
        journal.record(TaskRecord::from_report(
            "research",
            &report("a", TaskOutcome::Succeeded(json!("ra")), 1),
        ));
        journal.record(TaskRecord::from_report(
            "research",
            &report("b", TaskOutcome::Failed(TaskFailure::fatal("b", "boom", 3)), 3),
        ));
        journal.record(TaskRecord::not_started("d", "d", "d_out"));

        assert_eq!(journal.status_of("a"), Some(TaskStatus::Succeeded));
        assert_eq!(journal.get("a").unwrap().elapsed_ms, 12);
        assert_eq!(journal.status_of("d"), Some(TaskStatus::NotStarted));
        assert_eq!(journal.status_of("zzz"), None);

        let failures = journal.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "b");
        assert_eq!(failures[0].error.as_deref(), Some("boom"));
        assert_eq!(failures[0].attempts, 3);
    }

    #[test]
    fn test_report_serializes() {
        let mut journal = RunReport::new("session_1");
        journal.status = RunStatus::Cancelled;
        journal.record(TaskRecord::from_report(
            "c",
            &report("c", TaskOutcome::Failed(TaskFailure::cancelled("c", 1)), 1),
        ));

        let value = serde_json::to_value(&journal).unwrap();
        assert_eq!(value["status"], "cancelled");
        assert_eq!(value["records"][0]["status"], "cancelled");
    }
}
