//! 'session-pipeline' - A staged workflow orchestrator over one shared session state.
//!
//! A pipeline is an ordered list of stages. A stage is either a single
//! [`Task`](task::Task) or a [`ParallelGroup`](pipeline::ParallelGroup)
//! whose members run concurrently. Every task reads declared keys from an
//! immutable snapshot of the session state, invokes an
//! [`ExecutionBackend`](task::ExecutionBackend) (typically a call to a
//! reasoning service), and has its output committed under one output key
//! once its stage has resolved. While tasks run, their partial output is
//! streamed to the caller as tagged [`Fragment`](events::Fragment)s.
//!
//! ## Guarantees
//!
//! - A task never observes a value committed by a sibling in the same group.
//! - Stage *i+1* starts only after every write of stage *i* is committed.
//! - A failed task commits a [`TaskFailure`](task::TaskFailure) record and
//!   the run carries on; downstream tasks read that key as absent.
//! - Transient backend errors and timeouts are retried with capped
//!   exponential backoff, then committed as fatal failures.
//! - Cancellation resolves every active task as cancelled and starts no
//!   further stage. Earlier commits are untouched.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use session_pipeline::{Orchestrator, ParallelGroup, SequentialPipeline, Task};
//!
//! let pipeline = SequentialPipeline::builder("stock_research")
//!     .parallel(
//!         ParallelGroup::new("research")
//!             .with_task(Task::builder("technical", technical_backend)
//!                 .instruction("Analyze the chart of {{ ticker }}")
//!                 .output_key("technical_report")
//!                 .build()?)
//!             .with_task(Task::builder("fundamental", fundamental_backend)
//!                 .instruction("Review the financials of {{ ticker }}")
//!                 .output_key("fundamental_report")
//!                 .build()?),
//!     )
//!     .task(Task::builder("summary", summary_backend)
//!         .inputs(["technical_report", "fundamental_report"])
//!         .output_key("investment_summary")
//!         .build()?)
//!     .build()?;
//!
//! let mut run = Orchestrator::new(pipeline).start([("ticker", json!("AAPL"))]);
//! while let Some(fragment) = run.next().await {
//!     println!("[{}] {}", fragment.stage_name, fragment.as_text().unwrap_or(""));
//! }
//! println!("{:#?}", run.final_outputs()?);
//! ```
//!
//! ## Modules
//!
//! - [`state`]: session state and snapshots
//! - [`task`]: tasks, hooks, tools, backends and retry
//! - [`pipeline`]: stages, parallel groups, configuration and the run journal
//! - [`events`]: the fragment stream
//! - [`orchestrator`]: starting, observing and cancelling runs
//! - [`transcript`]: grouping a drained stream for presentation

pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod state;
pub mod task;
pub mod transcript;

#[cfg(feature = "observability")]
pub mod observability;

pub use events::{EventStream, Fragment, FragmentEmitter, FragmentKind, FragmentPayload};
pub use orchestrator::{CompletedRun, Orchestrator, PipelineRun};
pub use pipeline::{
    ParallelGroup, PipelineConfig, PipelineError, PipelineOutcome, RunReport, RunStatus,
    SequentialPipeline, Stage,
};
pub use state::{SessionState, StateSnapshot, StateValue};
pub use task::{
    Envelope, ExecutionBackend, ExecutionError, FailureKind, HookError, InputPolicy, Invocation,
    PreExecutionHook, RetryPolicy, Task, TaskFailure, TaskStatus, Tool, ToolError,
};
pub use transcript::Transcript;
