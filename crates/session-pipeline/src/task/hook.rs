//! Pre-execution hooks.
//!
//! Hooks run in declaration order after a task's inputs are resolved and
//! before its backend is invoked. Each hook may rewrite the envelope, answer
//! in the backend's place ([`HookOutcome::ShortCircuit`]), or abort the task
//! with a [`HookError`]. Hooks are synchronous and only see an immutable
//! snapshot; they never write session state.

use super::{Artifact, Envelope, HookError, render_template};
use crate::state::StateSnapshot;
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::debug;

/// Read-only context handed to every hook.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Snapshot the task's stage started from.
    pub snapshot: &'a StateSnapshot,
    /// Name of the task being prepared.
    pub task_name: &'a str,
    /// Key the task will commit to.
    pub output_key: &'a str,
}

/// What a hook decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Continue with this (possibly rewritten) envelope.
    Continue(Envelope),
    /// Skip execution and commit this value as the task's output.
    ShortCircuit(JsonValue),
}

/// A capability applied to a task before it executes.
pub trait PreExecutionHook: Send + Sync {
    /// Name used in logs and error records.
    fn name(&self) -> &str;

    /// Inspects or rewrites the envelope.
    fn apply(&self, envelope: Envelope, ctx: &HookContext<'_>) -> Result<HookOutcome, HookError>;
}

/// Adapter turning a closure into a hook.
///
/// # Examples
///
/// ```
/// use session_pipeline::task::{FnHook, HookOutcome};
///
/// let upper = FnHook::new("uppercase_ticker", |mut envelope, _ctx| {
///     if let Some(ticker) = envelope.input_str("ticker").map(str::to_uppercase) {
///         envelope.set_input("ticker", ticker.into());
///     }
///     Ok(HookOutcome::Continue(envelope))
/// });
/// ```
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(Envelope, &HookContext<'_>) -> Result<HookOutcome, HookError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> PreExecutionHook for FnHook<F>
where
    F: Fn(Envelope, &HookContext<'_>) -> Result<HookOutcome, HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, envelope: Envelope, ctx: &HookContext<'_>) -> Result<HookOutcome, HookError> {
        (self.f)(envelope, ctx)
    }
}

impl<F> fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook").field("name", &self.name).finish()
    }
}

/// Skips execution when the output key already holds a value
/// (for instance one carried over from an earlier run of the session).
#[derive(Debug, Clone, Default)]
pub struct ReuseExistingOutputHook;

impl PreExecutionHook for ReuseExistingOutputHook {
    fn name(&self) -> &str {
        "reuse_existing_output"
    }

    fn apply(&self, envelope: Envelope, ctx: &HookContext<'_>) -> Result<HookOutcome, HookError> {
        match ctx.snapshot.value(ctx.output_key) {
            Some(existing) => {
                debug!(task = %ctx.task_name, key = %ctx.output_key, "Reusing existing output");
                Ok(HookOutcome::ShortCircuit(existing.clone()))
            }
            None => Ok(HookOutcome::Continue(envelope)),
        }
    }
}

/// Aborts the task when any of the listed inputs is absent.
#[derive(Debug, Clone)]
pub struct RequireInputsHook {
    keys: Vec<String>,
}

impl RequireInputsHook {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl PreExecutionHook for RequireInputsHook {
    fn name(&self) -> &str {
        "require_inputs"
    }

    fn apply(&self, envelope: Envelope, ctx: &HookContext<'_>) -> Result<HookOutcome, HookError> {
        let missing: Vec<String> = self
            .keys
            .iter()
            .filter(|key| envelope.input(key).is_none() && ctx.snapshot.value(key).is_none())
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(HookOutcome::Continue(envelope))
        } else {
            Err(HookError::MissingInputs(missing))
        }
    }
}

/// Loads a file and attaches it to the envelope.
///
/// The path is a template rendered against the snapshot's readable values,
/// so `charts/{{ ticker }}.png` picks up the session's ticker.
#[derive(Debug, Clone)]
pub struct AttachFileHook {
    path_template: String,
    optional: bool,
}

impl AttachFileHook {
    pub fn new(path_template: impl Into<String>) -> Self {
        Self {
            path_template: path_template.into(),
            optional: false,
        }
    }

    /// Continue without an attachment when the file cannot be read.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

impl PreExecutionHook for AttachFileHook {
    fn name(&self) -> &str {
        "attach_file"
    }

    fn apply(
        &self,
        mut envelope: Envelope,
        ctx: &HookContext<'_>,
    ) -> Result<HookOutcome, HookError> {
        let path = render_template(&self.path_template, &ctx.snapshot.visible_values())
            .map_err(HookError::Template)?;

        match Artifact::from_path(&path) {
            Ok(artifact) => {
                debug!(
                    task = %ctx.task_name,
                    path = %path,
                    mime_type = %artifact.mime_type,
                    bytes = artifact.bytes.len(),
                    "Attached artifact"
                );
                envelope.attach(artifact);
                Ok(HookOutcome::Continue(envelope))
            }
            Err(e) if self.optional => {
                debug!(
                    task = %ctx.task_name,
                    path = %path,
                    error = %e,
                    "Optional artifact not attached"
                );
                Ok(HookOutcome::Continue(envelope))
            }
            Err(e) => Err(HookError::Artifact {
                path,
                reason: e.to_string(),
            }),
        }
    }
}
