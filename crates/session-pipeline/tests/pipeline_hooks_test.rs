//! Hook, tool and input-policy tests
//!
//! These tests verify the prepare step as seen through whole runs: hooks that
//! skip, reject or enrich a task, strict inputs, and backends calling tools.

use serde_json::{Value as JsonValue, json};
use session_pipeline::task::{
    AttachFileHook, ExecutionBackend, ExecutionError, FailureKind, Invocation,
    RequireInputsHook, ReuseExistingOutputHook, Task, TaskStatus, Tool, ToolError,
};
use session_pipeline::{
    FragmentKind, Orchestrator, RetryPolicy, SequentialPipeline, SessionState, StateValue,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

// ============================================================================
// Mock Backends & Tools
// ============================================================================

/// Counts invocations and returns its rendered instruction.
struct InstructionEcho {
    calls: AtomicU32,
}

impl InstructionEcho {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for InstructionEcho {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(call.envelope.instruction().unwrap_or_default()))
    }
}

/// Describes each attachment and streams it back as a binary fragment.
struct ChartReader;

#[async_trait::async_trait]
impl ExecutionBackend for ChartReader {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let attachments = call.envelope.attachments();
        if attachments.is_empty() {
            return Err(ExecutionError::fatal("no chart attached"));
        }
        for artifact in attachments {
            call.emitter
                .binary(artifact.bytes.clone(), artifact.mime_type.clone())
                .await;
        }
        Ok(json!({
            "charts": attachments.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
            "mime": attachments[0].mime_type,
        }))
    }
}

/// Looks up a price through the `price_lookup` tool.
struct PriceAnalyst;

#[async_trait::async_trait]
impl ExecutionBackend for PriceAnalyst {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let ticker = call
            .envelope
            .input_str("ticker")
            .ok_or_else(|| ExecutionError::fatal("ticker missing"))?;
        let price = call
            .tools
            .call("price_lookup", json!({ "ticker": ticker }))
            .await?;
        call.emitter.text(format!("{} trades at {}", ticker, price["price"])).await;
        Ok(price)
    }
}

struct PriceLookup {
    outages: AtomicU32,
}

#[async_trait::async_trait]
impl Tool for PriceLookup {
    fn name(&self) -> &str {
        "price_lookup"
    }

    fn description(&self) -> &str {
        "Returns the latest price for a ticker"
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        if self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ToolError::Unavailable {
                tool: "price_lookup".to_string(),
                reason: "upstream 503".to_string(),
            });
        }
        match args["ticker"].as_str() {
            Some("AAPL") => Ok(json!({ "ticker": "AAPL", "price": 187.5 })),
            Some(other) => Err(ToolError::InvalidArguments {
                tool: "price_lookup".to_string(),
                reason: format!("unknown ticker {}", other),
            }),
            None => Err(ToolError::InvalidArguments {
                tool: "price_lookup".to_string(),
                reason: "ticker must be a string".to_string(),
            }),
        }
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(2)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
        .without_jitter()
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_reuse_existing_output_skips_backend() {
    let backend = InstructionEcho::new();
    let pipeline = SequentialPipeline::builder("reuse")
        .task(
            Task::builder("technical", backend.clone())
                .instruction("Analyze {{ ticker }}")
                .hook(ReuseExistingOutputHook)
                .output_key("technical_report")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let session = SessionState::with_ids("stocks", "session_1", "user_1").with_values([
        ("ticker", json!("AAPL")),
        ("technical_report", json!("cached analysis")),
    ]);
    let mut run = Orchestrator::new(pipeline).start_session(session);
    run.drain().await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        run.final_state().unwrap().value("technical_report"),
        Some(&json!("cached analysis"))
    );
    assert_eq!(
        run.report().unwrap().status_of("technical"),
        Some(TaskStatus::Skipped)
    );
    assert_eq!(run.session_id(), "session_1");
}

#[tokio::test]
async fn test_strict_inputs_fail_before_execution() {
    let backend = InstructionEcho::new();
    let pipeline = SequentialPipeline::builder("strict")
        .task(
            Task::builder("summary", backend.clone())
                .instruction("{{ technical_report }} / {{ fundamental_report }}")
                .strict_inputs()
                .output_key("summary")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("technical_report", json!("uptrend"))])
        .await
        .unwrap();

    let failure = completed
        .state
        .get("summary")
        .and_then(StateValue::as_failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Hook);
    assert_eq!(failure.attempts, 0);
    assert!(failure.message.contains("fundamental_report"));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_lenient_inputs_render_absent_as_empty() {
    let pipeline = SequentialPipeline::builder("lenient")
        .task(
            Task::builder("summary", InstructionEcho::new())
                .instruction("T={{ technical_report }} F={{ fundamental_report }}")
                .output_key("summary")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("technical_report", json!("uptrend"))])
        .await
        .unwrap();

    assert_eq!(completed.state.value("summary"), Some(&json!("T=uptrend F=")));
}

#[tokio::test]
async fn test_lenient_inputs_allow_lookups_into_failed_record() {
    struct Broken;

    #[async_trait::async_trait]
    impl ExecutionBackend for Broken {
        async fn invoke(&self, _call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
            Err(ExecutionError::fatal("chart service rejected the ticker"))
        }
    }

    let backend = InstructionEcho::new();
    let pipeline = SequentialPipeline::builder("lenient_records")
        .task(
            Task::builder("technical", Arc::new(Broken))
                .output_key("technical_report")
                .build()
                .unwrap(),
        )
        .task(
            Task::builder("summary", backend.clone())
                .instruction("Trend: {{ technical_report.trend }}{{ technical_report[\"rsi\"] }}")
                .output_key("summary")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run(Vec::<(String, JsonValue)>::new())
        .await
        .unwrap();

    assert!(completed
        .state
        .get("technical_report")
        .is_some_and(StateValue::is_failure));
    assert_eq!(completed.state.value("summary"), Some(&json!("Trend: ")));
    assert_eq!(completed.report.status_of("summary"), Some(TaskStatus::Succeeded));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_require_inputs_hook_sees_upstream_failure_as_absent() {
    let pipeline = SequentialPipeline::builder("guarded")
        .task(
            Task::builder("summary", InstructionEcho::new())
                .hook(RequireInputsHook::new(["technical_report"]))
                .output_key("summary")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let session = SessionState::new("stocks").with_values([(
        "technical_report",
        StateValue::Failed(session_pipeline::TaskFailure::fatal("technical", "boom", 1)),
    )]);
    let mut run = Orchestrator::new(pipeline).start_session(session);
    run.drain().await;

    let failure = run
        .final_outputs()
        .unwrap()
        .get("summary")
        .and_then(StateValue::as_failure)
        .cloned()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Hook);
    assert_eq!(
        failure.message,
        "Missing required input(s): technical_report"
    );
}

#[tokio::test]
async fn test_attach_file_hook_feeds_backend() {
    let dir = tempfile::tempdir().unwrap();
    let png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A];
    std::fs::write(dir.path().join("AAPL.png"), &png).unwrap();

    let pipeline = SequentialPipeline::builder("charts")
        .task(
            Task::builder("technical", Arc::new(ChartReader))
                .hook(AttachFileHook::new(format!(
                    "{}/{{{{ ticker }}}}.png",
                    dir.path().display()
                )))
                .output_key("technical_report")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("ticker", json!("AAPL"))])
        .await
        .unwrap();

    assert_eq!(
        completed.state.value("technical_report"),
        Some(&json!({"charts": ["AAPL.png"], "mime": "image/png"}))
    );
    let artifacts = completed.transcript.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].bytes, png);
    assert_eq!(completed.transcript.fragments()[0].kind(), FragmentKind::Binary);
}

#[tokio::test]
async fn test_attach_file_hook_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = SequentialPipeline::builder("charts")
        .task(
            Task::builder("technical", Arc::new(ChartReader))
                .hook(AttachFileHook::new(format!(
                    "{}/{{{{ ticker }}}}.png",
                    dir.path().display()
                )))
                .output_key("technical_report")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("ticker", json!("MSFT"))])
        .await
        .unwrap();

    let failure = completed
        .state
        .get("technical_report")
        .and_then(StateValue::as_failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Hook);
    assert!(failure.message.contains("MSFT.png"));
}

// ============================================================================
// Tools
// ============================================================================

#[tokio::test]
async fn test_backend_calls_tool_with_transient_outage() {
    let pipeline = SequentialPipeline::builder("prices")
        .task(
            Task::builder("analyst", Arc::new(PriceAnalyst))
                .input("ticker")
                .tool(Arc::new(PriceLookup {
                    outages: AtomicU32::new(1),
                }))
                .retry(fast_retry())
                .output_key("price")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("ticker", json!("AAPL"))])
        .await
        .unwrap();

    assert_eq!(
        completed.state.value("price"),
        Some(&json!({"ticker": "AAPL", "price": 187.5}))
    );
    assert_eq!(completed.report.get("analyst").unwrap().attempts, 2);
    assert_eq!(
        completed.transcript.text_for("analyst"),
        Some("AAPL trades at 187.5")
    );
}

#[tokio::test]
async fn test_invalid_tool_arguments_are_fatal() {
    let pipeline = SequentialPipeline::builder("prices")
        .task(
            Task::builder("analyst", Arc::new(PriceAnalyst))
                .input("ticker")
                .tool(Arc::new(PriceLookup {
                    outages: AtomicU32::new(0),
                }))
                .retry(fast_retry())
                .output_key("price")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let completed = Orchestrator::new(pipeline)
        .run([("ticker", json!("ZZZZ"))])
        .await
        .unwrap();

    let failure = completed
        .state
        .get("price")
        .and_then(StateValue::as_failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.attempts, 1);
    assert!(failure.message.contains("unknown ticker ZZZZ"));
}
