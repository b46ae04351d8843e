//! Stock research workflow over mock backends.
//!
//! Technical and fundamental analysis run in parallel, then a summary
//! synthesizes both reports and a visualization step renders a poster.
//! Fragments are printed as they arrive.
//!
//! Run with: cargo run --example stock_research -- AAPL

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value as JsonValue, json};
use session_pipeline::observability::{self, ObservabilityConfig};
use session_pipeline::task::{
    ExecutionBackend, ExecutionError, Invocation, RequireInputsHook, Task, Tool, ToolError,
};
use session_pipeline::{
    FragmentPayload, Orchestrator, ParallelGroup, PipelineConfig, RetryPolicy,
    SequentialPipeline, StateValue,
};
use std::sync::Arc;
use std::time::Duration;

/// Renders a (fake) price chart for a ticker.
struct StockChartTool;

#[async_trait]
impl Tool for StockChartTool {
    fn name(&self) -> &str {
        "get_stock_chart"
    }

    fn description(&self) -> &str {
        "Renders a one-year daily price chart as PNG"
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let ticker = args["ticker"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: "get_stock_chart".to_string(),
                reason: "ticker must be a string".to_string(),
            })?;
        Ok(json!({
            "ticker": ticker,
            "png": [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            "trend": "higher highs since March",
        }))
    }
}

/// Reads the chart and streams a short technical read.
struct TechnicalAnalyst;

#[async_trait]
impl ExecutionBackend for TechnicalAnalyst {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let ticker = call.envelope.input_str("ticker").unwrap_or("UNKNOWN");
        let chart = call
            .tools
            .call("get_stock_chart", json!({ "ticker": ticker }))
            .await?;

        let png: Vec<u8> = chart["png"]
            .as_array()
            .map(|bytes| bytes.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect())
            .unwrap_or_default();
        call.emitter.binary(png, "image/png").await;

        let report = format!(
            "{}: {}; support holding at the 50-day average.",
            ticker, chart["trend"].as_str().unwrap_or("no clear trend")
        );
        call.emitter.text(report.clone()).await;
        Ok(json!(report))
    }
}

/// Streams a qualitative fundamental review chunk by chunk.
struct FundamentalAnalyst;

#[async_trait]
impl ExecutionBackend for FundamentalAnalyst {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let ticker = call.envelope.input_str("ticker").unwrap_or("UNKNOWN");
        let chunks = [
            format!("{} valuation sits above its five-year average. ", ticker),
            "Margins are stable and services revenue keeps growing. ".to_string(),
            "Analyst consensus leans Buy.".to_string(),
        ];

        let mut report = String::new();
        for chunk in chunks {
            tokio::time::sleep(Duration::from_millis(30)).await;
            call.emitter.text(chunk.clone()).await;
            report.push_str(&chunk);
        }
        Ok(json!(report))
    }
}

/// Synthesizes both reports into a recommendation.
struct Strategist;

#[async_trait]
impl ExecutionBackend for Strategist {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let bullish = call
            .envelope
            .input_str("fundamental_report")
            .is_some_and(|report| report.contains("leans Buy"));
        let recommendation = if bullish { "Buy" } else { "Hold" };
        let summary = format!(
            "Recommendation: {}. Short term: momentum intact. Long term: growth priced in.",
            recommendation
        );
        call.emitter.text(summary.clone()).await;
        Ok(json!({ "recommendation": recommendation, "summary": summary }))
    }
}

/// Produces a poster image from the summary.
struct PosterRenderer;

#[async_trait]
impl ExecutionBackend for PosterRenderer {
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError> {
        let summary = call
            .envelope
            .input("summary_report")
            .ok_or_else(|| ExecutionError::fatal("summary_report missing"))?;
        let poster = summary["summary"].as_str().unwrap_or_default().as_bytes().to_vec();
        call.emitter.binary(poster.clone(), "image/png").await;
        Ok(json!({ "poster_bytes": poster.len() }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init(ObservabilityConfig::default())?;

    let ticker = std::env::args().nth(1).unwrap_or_else(|| "AAPL".to_string());

    let technical = Task::builder("technical_analysis_agent", Arc::new(TechnicalAnalyst))
        .instruction(
            "Look at the provided stock chart of {{ ticker }} and provide the technical analysis.",
        )
        .tool(Arc::new(StockChartTool))
        .output_key("technical_report")
        .build()?;

    let fundamental = Task::builder("fundamental_analysis_agent", Arc::new(FundamentalAnalyst))
        .instruction("Perform a concise fundamental analysis of {{ ticker }}.")
        .output_key("fundamental_report")
        .timeout(Duration::from_secs(10))
        .build()?;

    let summary = Task::builder("summary_recommendation_agent", Arc::new(Strategist))
        .instruction(
            "<technical_report>{{ technical_report }}</technical_report>\n\
             <fundamental_report>{{ fundamental_report }}</fundamental_report>\n\
             Provide a final investment recommendation (Buy, Sell, or Hold).",
        )
        .output_key("summary_report")
        .build()?;

    let visualization = Task::builder("visualization_agent", Arc::new(PosterRenderer))
        .input("summary_report")
        .hook(RequireInputsHook::new(["summary_report"]))
        .output_key("visualization_report")
        .build()?;

    let pipeline = SequentialPipeline::builder("stock_research_workflow")
        .parallel(
            ParallelGroup::new("analysis_parallel_agent")
                .with_task(technical)
                .with_task(fundamental),
        )
        .task(summary)
        .task(visualization)
        .build()?;

    let config = PipelineConfig::new()
        .with_max_concurrent_tasks(4)
        .with_default_retry(RetryPolicy::new().with_max_retries(2));
    let orchestrator = Orchestrator::new(pipeline).with_config(config)?;

    let mut run = orchestrator.start([("ticker", json!(ticker))]);
    while let Some(fragment) = run.next().await {
        match &fragment.payload {
            FragmentPayload::Text(text) => println!("[{}] {}", fragment.stage_name, text),
            FragmentPayload::Binary(bytes) => println!(
                "[{}] <{} bytes of {}>",
                fragment.stage_name,
                bytes.len(),
                fragment.mime_type.as_deref().unwrap_or("binary")
            ),
        }
    }

    println!("\nStatus: {:?}", run.status()?);
    let mut outputs: Vec<_> = run.final_outputs()?.iter().collect();
    outputs.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in outputs {
        match value {
            StateValue::Value(value) => println!("{} = {}", key, value),
            StateValue::Failed(failure) => println!("{} failed: {}", key, failure),
        }
    }

    Ok(())
}
