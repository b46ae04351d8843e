//! End-to-end tests for pipeline runs
//!
//! These tests drive whole runs through the orchestrator and verify commit
//! visibility, group isolation and fragment ordering.

use futures::StreamExt;
use serde_json::{Value as JsonValue, json};
use session_pipeline::task::{
    ExecutionBackend, ExecutionError, FailureKind, FnHook, HookContext, HookOutcome, Invocation,
    Task, TaskStatus,
};
use session_pipeline::{
    Envelope, Fragment, Orchestrator, ParallelGroup, PipelineError, RetryPolicy, RunStatus,
    SequentialPipeline, StateValue,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Backends
// ============================================================================

/// Emits and returns a fixed string.
struct FixedBackend {
    output: &'static str,
}

#[async_trait::async_trait]
impl ExecutionBackend for FixedBackend {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        call.emitter.text(self.output).await;
        Ok(json!(self.output))
    }
}

/// Returns `label(input1,input2,..)` over the listed keys, absent ones skipped.
struct FormatBackend {
    label: &'static str,
    keys: Vec<&'static str>,
}

impl FormatBackend {
    fn new(label: &'static str, keys: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            label,
            keys: keys.to_vec(),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for FormatBackend {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let parts: Vec<&str> = self
            .keys
            .iter()
            .filter_map(|key| call.envelope.input_str(key))
            .collect();
        let output = format!("{}({})", self.label, parts.join(","));
        call.emitter.text(format!("{}:start", self.label)).await;
        call.emitter.text(format!("{}:end", self.label)).await;
        Ok(json!(output))
    }
}

/// Fails fatally on every attempt.
struct FatalBackend;

#[async_trait::async_trait]
impl ExecutionBackend for FatalBackend {
    async fn invoke(&self, _call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        Err(ExecutionError::fatal("malformed response"))
    }
}

/// Records whether a key was visible, then returns it unchanged.
struct ProbeBackend {
    key: &'static str,
    seen: Arc<Mutex<Vec<Option<JsonValue>>>>,
}

#[async_trait::async_trait]
impl ExecutionBackend for ProbeBackend {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        tokio::task::yield_now().await;
        self.seen
            .lock()
            .unwrap()
            .push(call.envelope.input(self.key).cloned());
        Ok(json!("probed"))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fixed(name: &str, output: &'static str, output_key: &str) -> Task {
    Task::builder(name, Arc::new(FixedBackend { output }))
        .input("subject")
        .output_key(output_key)
        .build()
        .unwrap()
}

/// `[Group(A, B), C, D]` over subject "X".
fn research_pipeline(b: Task) -> SequentialPipeline {
    SequentialPipeline::builder("research")
        .parallel(
            ParallelGroup::new("gather")
                .with_task(fixed("a", "ra", "a_out"))
                .with_task(b),
        )
        .task(
            Task::builder("c", FormatBackend::new("synthesis", &["a_out", "b_out"]))
                .inputs(["a_out", "b_out"])
                .output_key("c_out")
                .build()
                .unwrap(),
        )
        .task(
            Task::builder("d", FormatBackend::new("visual", &["c_out"]))
                .input("c_out")
                .output_key("d_out")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn value_map(outputs: &HashMap<String, StateValue>) -> HashMap<String, JsonValue> {
    outputs
        .iter()
        .filter_map(|(k, v)| v.as_value().map(|value| (k.clone(), value.clone())))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_end_to_end_scenario() {
    let orchestrator = Orchestrator::new(research_pipeline(fixed("b", "rb", "b_out")));

    let mut run = orchestrator.start([("subject", json!("X"))]);
    let fragments: Vec<Fragment> = (&mut run).collect().await;

    let outputs = run.final_outputs().unwrap();
    let expected: HashMap<String, JsonValue> = [
        ("subject", json!("X")),
        ("a_out", json!("ra")),
        ("b_out", json!("rb")),
        ("c_out", json!("synthesis(ra,rb)")),
        ("d_out", json!("visual(synthesis(ra,rb))")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    assert_eq!(value_map(outputs), expected);
    assert_eq!(outputs.len(), 5);

    assert_eq!(run.status().unwrap(), RunStatus::Completed);
    assert!(run.report().unwrap().failures().is_empty());
    assert_eq!(fragments.len(), 6);
}

#[tokio::test]
async fn test_group_member_failure_is_isolated() {
    let b = Task::builder("b", Arc::new(FatalBackend))
        .input("subject")
        .output_key("b_out")
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(research_pipeline(b));

    let mut run = orchestrator.start([("subject", json!("X"))]);
    let _transcript = run.drain().await;
    let outputs = run.final_outputs().unwrap();

    assert_eq!(outputs.get("a_out"), Some(&StateValue::Value(json!("ra"))));

    let failure = outputs
        .get("b_out")
        .and_then(StateValue::as_failure)
        .expect("b_out should hold a failure record");
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.task, "b");
    assert_eq!(failure.attempts, 1);

    // C treats the failed key as absent and still commits.
    assert_eq!(
        outputs.get("c_out"),
        Some(&StateValue::Value(json!("synthesis(ra)")))
    );
    assert_eq!(
        run.report().unwrap().status_of("b"),
        Some(TaskStatus::Failed)
    );
    assert_eq!(run.status().unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn test_fragments_follow_stage_order() {
    let orchestrator = Orchestrator::new(research_pipeline(fixed("b", "rb", "b_out")));

    let mut run = orchestrator.start([("subject", json!("X"))]);
    let fragments: Vec<Fragment> = (&mut run).collect().await;
    let stages: Vec<&str> = fragments.iter().map(|f| f.stage_name.as_str()).collect();

    let last_group = stages
        .iter()
        .rposition(|s| *s == "a" || *s == "b")
        .unwrap();
    let first_c = stages.iter().position(|s| *s == "c").unwrap();
    let last_c = stages.iter().rposition(|s| *s == "c").unwrap();
    let first_d = stages.iter().position(|s| *s == "d").unwrap();
    assert!(last_group < first_c);
    assert!(last_c < first_d);

    // Per-task emission order is preserved.
    let c_texts: Vec<&str> = fragments
        .iter()
        .filter(|f| f.stage_name == "c")
        .filter_map(Fragment::as_text)
        .collect();
    assert_eq!(c_texts, vec!["synthesis:start", "synthesis:end"]);
}

#[tokio::test]
async fn test_siblings_never_see_each_other() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = SequentialPipeline::builder("isolation")
        .parallel(
            ParallelGroup::new("group")
                .with_task(fixed("writer", "written", "shared_out"))
                .with_task(
                    Task::builder(
                        "reader",
                        Arc::new(ProbeBackend {
                            key: "shared_out",
                            seen: Arc::clone(&seen),
                        }),
                    )
                    .input("shared_out")
                    .output_key("reader_out")
                    .build()
                    .unwrap(),
                ),
        )
        .task(
            Task::builder(
                "later",
                Arc::new(ProbeBackend {
                    key: "shared_out",
                    seen: Arc::clone(&seen),
                }),
            )
            .input("shared_out")
            .output_key("later_out")
            .build()
            .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("subject", json!("X"))])
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![None, Some(json!("written"))]);
    assert_eq!(completed.state.value("shared_out"), Some(&json!("written")));
}

#[tokio::test]
async fn test_group_members_share_identical_snapshot() {
    let observed: Arc<Mutex<Vec<HashMap<String, StateValue>>>> = Arc::new(Mutex::new(Vec::new()));

    let recording_task = |name: &str, output: &'static str| {
        let observed = Arc::clone(&observed);
        Task::builder(name, Arc::new(FixedBackend { output }))
            .output_key(format!("{}_out", name))
            .hook(FnHook::new(
                "record_snapshot",
                move |envelope: Envelope, ctx: &HookContext<'_>| {
                    observed.lock().unwrap().push(ctx.snapshot.to_map());
                    Ok(HookOutcome::Continue(envelope))
                },
            ))
            .build()
            .unwrap()
    };

    let pipeline = SequentialPipeline::builder("snapshots")
        .task(fixed("seed", "seeded", "seed_out"))
        .parallel(
            ParallelGroup::new("group")
                .with_task(recording_task("left", "l"))
                .with_task(recording_task("right", "r")),
        )
        .build()
        .unwrap();

    Orchestrator::new(pipeline)
        .run([("subject", json!("X"))])
        .await
        .unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], observed[1]);
    assert!(observed[0].contains_key("seed_out"));
    assert!(!observed[0].contains_key("left_out"));
    assert!(!observed[0].contains_key("right_out"));
}

#[tokio::test]
async fn test_final_outputs_include_failure_records() {
    let pipeline = SequentialPipeline::builder("fails")
        .task(
            Task::builder("broken", Arc::new(FatalBackend))
                .output_key("broken_out")
                .retry(RetryPolicy::no_retry())
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let mut run = Orchestrator::new(pipeline).start(Vec::<(String, JsonValue)>::new());
    run.drain().await;

    let outputs = run.final_outputs().unwrap();
    assert!(outputs.get("broken_out").is_some_and(StateValue::is_failure));
    assert_eq!(run.final_state().unwrap().value("broken_out"), None);
}

#[tokio::test]
async fn test_into_outcome_before_drain() {
    let orchestrator = Orchestrator::new(research_pipeline(fixed("b", "rb", "b_out")));
    let run = orchestrator.start([("subject", json!("X"))]);
    assert!(matches!(run.into_outcome(), Err(PipelineError::NotDrained)));
}
