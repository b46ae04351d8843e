//! The input envelope handed to a task's backend.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;

/// An in-memory artifact attached to an envelope (e.g. a chart image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Identifying name (usually the file name).
    pub name: String,
    /// MIME type (e.g. "image/png").
    pub mime_type: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// Creates an artifact from raw bytes.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Reads a file, guessing the MIME type from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            mime_type,
            bytes,
        })
    }

    /// Returns true if the MIME type is an image type.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Resolved inputs plus everything hooks attached, for one task execution.
///
/// Every declared input key is present in `inputs`; keys that were absent
/// from the snapshot resolve to `null`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    task: String,
    inputs: BTreeMap<String, JsonValue>,
    instruction: Option<String>,
    attachments: Vec<Artifact>,
}

impl Envelope {
    /// Creates an empty envelope for the named task.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    /// Name of the task this envelope belongs to.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Returns the resolved input, `None` if it is absent (missing or null).
    pub fn input(&self, key: &str) -> Option<&JsonValue> {
        self.inputs.get(key).filter(|v| !v.is_null())
    }

    /// Returns the resolved input as a string slice, if it is a JSON string.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input(key).and_then(JsonValue::as_str)
    }

    /// All resolved inputs, absent ones as `null`.
    pub fn inputs(&self) -> &BTreeMap<String, JsonValue> {
        &self.inputs
    }

    /// Declared inputs that resolved to absent.
    pub fn missing_inputs(&self) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Sets (or overrides) an input.
    pub fn set_input(&mut self, key: impl Into<String>, value: JsonValue) {
        self.inputs.insert(key.into(), value);
    }

    /// Builder form of [`Envelope::set_input`].
    pub fn with_input(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.set_input(key, value);
        self
    }

    /// The rendered instruction, if the task has one.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Replaces the instruction.
    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        self.instruction = Some(instruction.into());
    }

    /// Builder form of [`Envelope::set_instruction`].
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.set_instruction(instruction);
        self
    }

    /// Artifacts attached by hooks, in attachment order.
    pub fn attachments(&self) -> &[Artifact] {
        &self.attachments
    }

    /// Attaches an artifact.
    pub fn attach(&mut self, artifact: Artifact) {
        self.attachments.push(artifact);
    }

    /// Builder form of [`Envelope::attach`].
    pub fn with_attachment(mut self, artifact: Artifact) -> Self {
        self.attach(artifact);
        self
    }
}
