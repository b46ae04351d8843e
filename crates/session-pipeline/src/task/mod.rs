//! Tasks: the smallest unit of work in a pipeline.
//!
//! A [`Task`] is a stateless definition built once at pipeline construction.
//! Each run it goes through three steps:
//!
//! 1. **prepare**: resolve the declared input keys from the stage snapshot
//!    (absent keys become `null`), render the instruction template, then apply
//!    the pre-execution hooks in order.
//! 2. **execute**: invoke the [`ExecutionBackend`] under the task's retry
//!    policy, timeout and the run's cancellation token.
//! 3. **commit**: the pipeline writes the outcome (value or [`TaskFailure`])
//!    under the task's output key once the whole stage has resolved.
//!
//! # Example
//!
//! ```rust,ignore
//! use session_pipeline::task::{AttachFileHook, RetryPolicy, Task};
//!
//! let technical = Task::builder("technical_analysis_agent", Arc::new(ChartReader::new()))
//!     .instruction("Provide the technical analysis of {{ ticker }} from the attached chart.")
//!     .hook(AttachFileHook::new("charts/{{ ticker }}.png"))
//!     .output_key("technical_report")
//!     .retry(RetryPolicy::new().with_max_retries(3))
//!     .build()?;
//! ```

pub mod backend;
pub mod envelope;
pub mod error;
pub mod hook;
pub mod retry;
pub mod tool;

pub use backend::{ExecutionBackend, Invocation};
pub use envelope::{Artifact, Envelope};
pub use error::{ExecutionError, FailureKind, HookError, TaskFailure, ToolError};
pub use hook::{
    AttachFileHook, FnHook, HookContext, HookOutcome, PreExecutionHook, RequireInputsHook,
    ReuseExistingOutputHook,
};
pub use retry::{RetryOutcome, RetryPolicy, execute_with_retry};
pub use tool::{Tool, Toolset};

use crate::events::FragmentEmitter;
use crate::pipeline::PipelineError;
use crate::state::{StateSnapshot, StateValue};
use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a task treats absent declared inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Absent inputs resolve to `null`; the backend decides what to do.
    #[default]
    Lenient,
    /// Any absent input fails the task before execution.
    Strict,
}

/// Terminal status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The backend produced the committed value.
    Succeeded,
    /// A hook answered in the backend's place.
    Skipped,
    /// A failure record was committed.
    Failed,
    /// The run was cancelled while the task was active.
    Cancelled,
    /// The run was cancelled before the task's stage started.
    NotStarted,
}

/// What a task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The backend's value.
    Succeeded(JsonValue),
    /// The value a hook answered with.
    Skipped(JsonValue),
    /// The failure record to commit.
    Failed(TaskFailure),
}

impl TaskOutcome {
    /// Terminal status; cancellation records map to [`TaskStatus::Cancelled`].
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Succeeded(_) => TaskStatus::Succeeded,
            TaskOutcome::Skipped(_) => TaskStatus::Skipped,
            TaskOutcome::Failed(failure) if failure.is_cancelled() => TaskStatus::Cancelled,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
        }
    }

    /// The produced value, if any.
    pub fn value(&self) -> Option<&JsonValue> {
        match self {
            TaskOutcome::Succeeded(value) | TaskOutcome::Skipped(value) => Some(value),
            TaskOutcome::Failed(_) => None,
        }
    }

    /// The failure record, if the task failed.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// The entry this outcome commits.
    pub fn to_state_value(&self) -> StateValue {
        match self {
            TaskOutcome::Succeeded(value) | TaskOutcome::Skipped(value) => {
                StateValue::Value(value.clone())
            }
            TaskOutcome::Failed(failure) => StateValue::Failed(failure.clone()),
        }
    }
}

/// Result of one task run, ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task: String,
    pub output_key: String,
    pub outcome: TaskOutcome,
    /// Backend invocations made.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl TaskReport {
    pub fn status(&self) -> TaskStatus {
        self.outcome.status()
    }

    /// The `(key, entry)` pair committed for this task.
    pub fn write(&self) -> (String, StateValue) {
        (self.output_key.clone(), self.outcome.to_state_value())
    }
}

/// Successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub value: JsonValue,
    pub attempts: u32,
}

/// Run-scoped settings a task executes under.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Root emitter; the task tags it with its own name.
    pub emitter: FragmentEmitter,
    pub cancel: CancellationToken,
    /// Used when the task has no policy of its own.
    pub retry: RetryPolicy,
    /// Used when the task has no timeout of its own.
    pub timeout: Option<Duration>,
}

impl TaskContext {
    pub fn new(emitter: FragmentEmitter) -> Self {
        Self {
            emitter,
            cancel: CancellationToken::new(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A unit of work with declared inputs, one output key and ordered hooks.
pub struct Task {
    name: String,
    input_keys: Vec<String>,
    output_key: String,
    instruction: Option<String>,
    hooks: Vec<Arc<dyn PreExecutionHook>>,
    tools: Toolset,
    backend: Arc<dyn ExecutionBackend>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    input_policy: InputPolicy,
}

impl Task {
    /// Starts building a task executed by `backend`.
    pub fn builder(name: impl Into<String>, backend: Arc<dyn ExecutionBackend>) -> TaskBuilder {
        TaskBuilder::new(name, backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys read from the snapshot, in declaration order.
    pub fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Hook names in application order.
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn tools(&self) -> &Toolset {
        &self.tools
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn input_policy(&self) -> InputPolicy {
        self.input_policy
    }

    /// Resolves inputs, renders the instruction and applies hooks.
    ///
    /// Absent inputs never fail this step under [`InputPolicy::Lenient`].
    pub fn prepare(&self, snapshot: &StateSnapshot) -> Result<HookOutcome, HookError> {
        let mut envelope = Envelope::new(self.name.clone());
        for key in &self.input_keys {
            let value = snapshot.value(key).cloned().unwrap_or(JsonValue::Null);
            envelope.set_input(key.clone(), value);
        }

        if self.input_policy == InputPolicy::Strict {
            let missing = envelope.missing_inputs();
            if !missing.is_empty() {
                return Err(HookError::MissingInputs(missing));
            }
        }

        if let Some(template) = &self.instruction {
            let rendered = {
                let present: BTreeMap<&str, &JsonValue> = envelope
                    .inputs()
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.as_str(), v))
                    .collect();
                render_template(template, &present).map_err(HookError::Template)?
            };
            envelope.set_instruction(rendered);
        }

        let ctx = HookContext {
            snapshot,
            task_name: &self.name,
            output_key: &self.output_key,
        };

        for hook in &self.hooks {
            match hook.apply(envelope, &ctx)? {
                HookOutcome::Continue(next) => envelope = next,
                HookOutcome::ShortCircuit(value) => {
                    debug!(
                        task = %self.name,
                        hook = %hook.name(),
                        "Hook short-circuited execution"
                    );
                    return Ok(HookOutcome::ShortCircuit(value));
                }
            }
        }

        Ok(HookOutcome::Continue(envelope))
    }

    /// Invokes the backend under retry, timeout and cancellation.
    pub async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &TaskContext,
    ) -> Result<Executed, TaskFailure> {
        let emitter = ctx.emitter.for_stage(self.name.clone());
        let policy = self.retry.as_ref().unwrap_or(&ctx.retry);
        let timeout = self.timeout.or(ctx.timeout);
        let backend = &self.backend;
        let tools = &self.tools;

        let outcome = execute_with_retry(policy, timeout, &ctx.cancel, |attempt| {
            backend.invoke(Invocation {
                envelope,
                tools,
                emitter: &emitter,
                attempt,
            })
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => Ok(Executed { value, attempts }),
            RetryOutcome::Failed {
                error,
                attempts,
                exhausted,
            } => {
                let message = if exhausted {
                    format!("Retries exhausted after {} attempt(s): {}", attempts, error)
                } else {
                    error.to_string()
                };
                Err(TaskFailure::fatal(self.name.clone(), message, attempts))
            }
            RetryOutcome::Cancelled { attempts } => {
                warn!(task = %self.name, attempts, "Task cancelled");
                Err(TaskFailure::cancelled(self.name.clone(), attempts))
            }
        }
    }

    /// Prepares and executes the task against `snapshot`.
    ///
    /// Never fails: every error becomes a [`TaskOutcome::Failed`] record.
    pub async fn run(&self, snapshot: &StateSnapshot, ctx: &TaskContext) -> TaskReport {
        let started = Instant::now();

        if ctx.cancel.is_cancelled() {
            return self.report(
                TaskOutcome::Failed(TaskFailure::cancelled(self.name.clone(), 0)),
                0,
                started,
            );
        }

        let envelope = match self.prepare(snapshot) {
            Ok(HookOutcome::Continue(envelope)) => envelope,
            Ok(HookOutcome::ShortCircuit(value)) => {
                info!(task = %self.name, "Task skipped by hook");
                return self.report(TaskOutcome::Skipped(value), 0, started);
            }
            Err(e) => {
                warn!(task = %self.name, error = %e, "Task aborted by hook");
                return self.report(
                    TaskOutcome::Failed(TaskFailure::hook(self.name.clone(), &e)),
                    0,
                    started,
                );
            }
        };

        match self.execute(&envelope, ctx).await {
            Ok(Executed { value, attempts }) => {
                info!(task = %self.name, attempts, "Task completed successfully");
                self.report(TaskOutcome::Succeeded(value), attempts, started)
            }
            Err(failure) => {
                if !failure.is_cancelled() {
                    warn!(task = %self.name, error = %failure.message, "Task failed");
                }
                let attempts = failure.attempts;
                self.report(TaskOutcome::Failed(failure), attempts, started)
            }
        }
    }

    fn report(&self, outcome: TaskOutcome, attempts: u32, started: Instant) -> TaskReport {
        TaskReport {
            task: self.name.clone(),
            output_key: self.output_key.clone(),
            outcome,
            attempts,
            elapsed: started.elapsed(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("input_keys", &self.input_keys)
            .field("output_key", &self.output_key)
            .field("hooks", &self.hook_names())
            .field("tools", &self.tools)
            .field("backend", &self.backend.name())
            .field("input_policy", &self.input_policy)
            .finish()
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    name: String,
    backend: Arc<dyn ExecutionBackend>,
    input_keys: Vec<String>,
    output_key: Option<String>,
    instruction: Option<String>,
    hooks: Vec<Arc<dyn PreExecutionHook>>,
    tools: Toolset,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    input_policy: InputPolicy,
}

impl TaskBuilder {
    fn new(name: impl Into<String>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            input_keys: Vec::new(),
            output_key: None,
            instruction: None,
            hooks: Vec::new(),
            tools: Toolset::new(),
            retry: None,
            timeout: None,
            input_policy: InputPolicy::default(),
        }
    }

    /// Declares an input key.
    pub fn input(mut self, key: impl Into<String>) -> Self {
        self.input_keys.push(key.into());
        self
    }

    /// Declares several input keys.
    pub fn inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Sets the output key. Defaults to `<name>_output`.
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Sets the instruction template. Its variables are added to the declared inputs.
    pub fn instruction(mut self, template: impl Into<String>) -> Self {
        self.instruction = Some(template.into());
        self
    }

    /// Appends a pre-execution hook.
    pub fn hook(self, hook: impl PreExecutionHook + 'static) -> Self {
        self.shared_hook(Arc::new(hook))
    }

    /// Appends a hook shared with other tasks.
    pub fn shared_hook(mut self, hook: Arc<dyn PreExecutionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Registers a tool for the backend.
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    /// Shorthand for [`InputPolicy::Strict`].
    pub fn strict_inputs(self) -> Self {
        self.input_policy(InputPolicy::Strict)
    }

    pub fn build(self) -> Result<Task, PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidTask(
                "task name must not be empty".to_string(),
            ));
        }

        let output_key = self
            .output_key
            .unwrap_or_else(|| format!("{}_output", self.name));
        if output_key.trim().is_empty() {
            return Err(PipelineError::InvalidTask(format!(
                "task '{}' has an empty output key",
                self.name
            )));
        }

        let mut input_keys: Vec<String> = Vec::with_capacity(self.input_keys.len());
        for key in self.input_keys {
            if !input_keys.contains(&key) {
                input_keys.push(key);
            }
        }
        if let Some(template) = &self.instruction {
            let variables = template_variables(template).map_err(|e| {
                PipelineError::Template(format!("task '{}': {}", self.name, e))
            })?;
            for variable in variables {
                if !input_keys.contains(&variable) {
                    input_keys.push(variable);
                }
            }
        }

        Ok(Task {
            name: self.name,
            input_keys,
            output_key,
            instruction: self.instruction,
            hooks: self.hooks,
            tools: self.tools,
            backend: self.backend,
            retry: self.retry,
            timeout: self.timeout,
            input_policy: self.input_policy,
        })
    }
}

/// Absent values, and attribute or item lookups on them, render as empty.
fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env
}

/// Renders a template against `ctx`.
pub(crate) fn render_template<S: Serialize>(template: &str, ctx: &S) -> Result<String, String> {
    template_env()
        .render_str(template, ctx)
        .map_err(|e| e.to_string())
}

/// Top-level variables a template reads, sorted.
fn template_variables(template: &str) -> Result<Vec<String>, String> {
    let env = template_env();
    let tmpl = env.template_from_str(template).map_err(|e| e.to_string())?;
    let mut variables: Vec<String> = tmpl.undeclared_variables(false).into_iter().collect();
    variables.sort();
    Ok(variables)
}
