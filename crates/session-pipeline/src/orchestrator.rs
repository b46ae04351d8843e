//! Drives a pipeline run and exposes it as a stream of fragments.
//!
//! [`Orchestrator::start`] spawns the run on the Tokio runtime and returns a
//! [`PipelineRun`] immediately. The run is a `Stream<Item = Fragment>`; it
//! ends once every stage has committed (or cancellation stopped the run),
//! after which the final session state and the run journal are available.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! let orchestrator = Orchestrator::new(pipeline).with_config(config)?;
//! let mut run = orchestrator.start([("ticker", json!("AAPL"))]);
//!
//! while let Some(fragment) = run.next().await {
//!     println!("[{}] {:?}", fragment.stage_name, fragment.as_text());
//! }
//!
//! let outputs = run.final_outputs()?;
//! ```

use crate::events::{self, EventStream, Fragment};
use crate::pipeline::{
    PipelineConfig, PipelineError, PipelineOutcome, RunContext, RunReport, RunStatus,
    SequentialPipeline,
};
use crate::state::{SessionState, StateValue};
use crate::transcript::Transcript;
use futures::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, info, info_span};

/// Runs a [`SequentialPipeline`] against fresh sessions.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pipeline: Arc<SequentialPipeline>,
    config: PipelineConfig,
    app_name: String,
}

impl Orchestrator {
    /// Creates an orchestrator with the default configuration.
    ///
    /// The pipeline's name doubles as the application name of new sessions.
    pub fn new(pipeline: SequentialPipeline) -> Self {
        let app_name = pipeline.name().to_string();
        Self {
            pipeline: Arc::new(pipeline),
            config: PipelineConfig::default(),
            app_name,
        }
    }

    /// Replaces the configuration after validating it.
    pub fn with_config(mut self, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn pipeline(&self) -> &SequentialPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Starts a run on a new session seeded with `initial` values.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<K, I>(&self, initial: I) -> PipelineRun
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        self.start_session(SessionState::new(self.app_name.clone()).with_values(initial))
    }

    /// Starts a run on an existing session.
    ///
    /// Values already in `state` are visible to the first stage, so keys
    /// carried over from an earlier run can be reused by hooks.
    pub fn start_session(&self, state: SessionState) -> PipelineRun {
        let (emitter, events) = events::channel(self.config.event_buffer);
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(emitter, &self.config).with_cancellation(cancel.clone());
        let finished = Arc::new(OnceLock::new());
        let session_id = state.session_id().to_string();

        let run_span = info_span!(
            "pipeline_run",
            pipeline = %self.pipeline.name(),
            session_id = %session_id,
            stages = self.pipeline.stages().len(),
        );

        let pipeline = Arc::clone(&self.pipeline);
        let slot = Arc::clone(&finished);
        tokio::spawn(
            async move {
                info!(tasks = pipeline.task_count(), "Starting pipeline run");
                let outcome = pipeline.run(state, &ctx).await;
                info!(
                    status = ?outcome.report.status,
                    failures = outcome.report.failures().len(),
                    "Pipeline run finished"
                );
                let _ = slot.set(outcome);
                drop(slot);
                // Dropping the last emitter ends the stream, so the final
                // state is always recorded before consumers observe the end.
                drop(ctx);
            }
            .instrument(run_span),
        );

        PipelineRun {
            session_id,
            events,
            abandon: Some(cancel.clone().drop_guard()),
            cancel,
            finished,
            drained: false,
        }
    }

    /// Starts a run and drains it.
    pub async fn run<K, I>(&self, initial: I) -> Result<CompletedRun, PipelineError>
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        let mut run = self.start(initial);
        let transcript = run.drain().await;
        let outcome = run.into_outcome()?;
        Ok(CompletedRun {
            transcript,
            state: outcome.state,
            report: outcome.report,
        })
    }
}

/// A drained run.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub transcript: Transcript,
    pub state: SessionState,
    pub report: RunReport,
}

/// A running pipeline: the fragment stream plus its control handle.
///
/// The stream is finite and not restartable. Results become available once
/// it has returned `None`. Dropping the run before then cancels it.
#[derive(Debug)]
pub struct PipelineRun {
    session_id: String,
    events: EventStream,
    cancel: CancellationToken,
    /// Cancels the run if it is dropped undrained; disarmed at end of stream.
    abandon: Option<DropGuard>,
    finished: Arc<OnceLock<PipelineOutcome>>,
    drained: bool,
}

impl PipelineRun {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cancels the run.
    ///
    /// Active tasks resolve as cancelled, their stage commits, and no further
    /// stage starts. Keep draining the stream to observe the end.
    pub fn cancel(&self) {
        info!(session_id = %self.session_id, "Cancellation requested");
        self.cancel.cancel();
    }

    /// A token that cancels this run, for use from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the stream has ended.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Every committed key, values and failure records alike.
    pub fn final_outputs(&self) -> Result<&HashMap<String, StateValue>, PipelineError> {
        self.outcome().map(|o| o.state.values())
    }

    pub fn final_state(&self) -> Result<&SessionState, PipelineError> {
        self.outcome().map(|o| &o.state)
    }

    /// Per-task journal of the run.
    pub fn report(&self) -> Result<&RunReport, PipelineError> {
        self.outcome().map(|o| &o.report)
    }

    pub fn status(&self) -> Result<RunStatus, PipelineError> {
        self.outcome().map(|o| o.report.status)
    }

    /// Consumes the rest of the stream into a [`Transcript`].
    pub async fn drain(&mut self) -> Transcript {
        let mut transcript = Transcript::new();
        while let Some(fragment) = self.next().await {
            transcript.push(fragment);
        }
        transcript
    }

    /// Takes the final state and journal.
    pub fn into_outcome(self) -> Result<PipelineOutcome, PipelineError> {
        if !self.drained {
            return Err(PipelineError::NotDrained);
        }
        match Arc::try_unwrap(self.finished) {
            Ok(slot) => slot.into_inner().ok_or(PipelineError::RunAborted),
            Err(shared) => shared.get().cloned().ok_or(PipelineError::RunAborted),
        }
    }

    fn outcome(&self) -> Result<&PipelineOutcome, PipelineError> {
        if !self.drained {
            return Err(PipelineError::NotDrained);
        }
        self.finished.get().ok_or(PipelineError::RunAborted)
    }
}

impl Stream for PipelineRun {
    type Item = Fragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.drained {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.events).poll_next(cx) {
            Poll::Ready(None) => {
                self.drained = true;
                if let Some(guard) = self.abandon.take() {
                    let _ = guard.disarm();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
