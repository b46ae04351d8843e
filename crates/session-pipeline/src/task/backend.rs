//! The execution backend collaborator.

use super::{Envelope, ExecutionError, Toolset};
use crate::events::FragmentEmitter;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Everything a backend receives for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Resolved inputs, rendered instruction and attachments.
    pub envelope: &'a Envelope,
    /// Tools registered on the task.
    pub tools: &'a Toolset,
    /// Emitter tagged with the task's name.
    pub emitter: &'a FragmentEmitter,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Performs a task's unit of work (typically a call to a reasoning service).
///
/// The returned value becomes the task's committed output. Fragments emitted
/// along the way reach the caller immediately; an attempt that fails after
/// emitting is not rolled back.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runs one attempt.
    async fn invoke(&self, call: Invocation<'_>) -> Result<JsonValue, ExecutionError>;

    /// Returns the name of this backend.
    ///
    /// By default, this returns the type name.
    fn name(&self) -> String {
        std::any::type_name::<Self>()
            .split("::")
            .last()
            .unwrap_or("UnknownBackend")
            .to_string()
    }
}
