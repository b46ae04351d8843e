//! Streaming output fragments.
//!
//! Tasks emit [`Fragment`]s through a [`FragmentEmitter`] while they run; the
//! caller consumes them from an [`EventStream`]. The channel is bounded, so a
//! slow consumer applies backpressure to emitting tasks.

use base64::{Engine, engine::general_purpose::STANDARD};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Kind of a fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Text,
    Binary,
}

/// Payload of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentPayload {
    Text(String),
    Binary(Vec<u8>),
}

/// One unit of streamed output, tagged with the task that produced it.
///
/// Serializes as `{stage_name, kind, payload, mime_type?}`; binary payloads
/// are base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "FragmentWire", try_from = "FragmentWire")]
pub struct Fragment {
    /// Name of the producing task.
    pub stage_name: String,
    /// The content.
    pub payload: FragmentPayload,
    /// MIME type, always set for binary fragments.
    pub mime_type: Option<String>,
}

impl Fragment {
    /// Creates a text fragment.
    pub fn text(stage_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            payload: FragmentPayload::Text(text.into()),
            mime_type: None,
        }
    }

    /// Creates a binary fragment (e.g. a rendered image).
    pub fn binary(
        stage_name: impl Into<String>,
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            payload: FragmentPayload::Binary(bytes),
            mime_type: Some(mime_type.into()),
        }
    }

    /// Returns the payload kind.
    pub fn kind(&self) -> FragmentKind {
        match self.payload {
            FragmentPayload::Text(_) => FragmentKind::Text,
            FragmentPayload::Binary(_) => FragmentKind::Binary,
        }
    }

    /// Returns the text payload, if this is a text fragment.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            FragmentPayload::Text(text) => Some(text),
            FragmentPayload::Binary(_) => None,
        }
    }

    /// Returns the binary payload, if this is a binary fragment.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            FragmentPayload::Binary(bytes) => Some(bytes),
            FragmentPayload::Text(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FragmentWire {
    stage_name: String,
    kind: FragmentKind,
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
}

impl From<Fragment> for FragmentWire {
    fn from(fragment: Fragment) -> Self {
        let kind = fragment.kind();
        let payload = match fragment.payload {
            FragmentPayload::Text(text) => text,
            FragmentPayload::Binary(bytes) => STANDARD.encode(bytes),
        };
        Self {
            stage_name: fragment.stage_name,
            kind,
            payload,
            mime_type: fragment.mime_type,
        }
    }
}

impl TryFrom<FragmentWire> for Fragment {
    type Error = base64::DecodeError;

    fn try_from(wire: FragmentWire) -> Result<Self, Self::Error> {
        let payload = match wire.kind {
            FragmentKind::Text => FragmentPayload::Text(wire.payload),
            FragmentKind::Binary => FragmentPayload::Binary(STANDARD.decode(wire.payload)?),
        };
        Ok(Self {
            stage_name: wire.stage_name,
            payload,
            mime_type: wire.mime_type,
        })
    }
}

/// Creates a bounded fragment channel.
///
/// The returned emitter is untagged; use [`FragmentEmitter::for_stage`] to
/// get a handle that tags fragments with a task name. The stream ends once
/// every emitter has been dropped.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel(capacity: usize) -> (FragmentEmitter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        FragmentEmitter {
            stage_name: String::new(),
            tx,
        },
        EventStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// Sending half of the event stream, tagged with a producing task.
#[derive(Debug, Clone)]
pub struct FragmentEmitter {
    stage_name: String,
    tx: mpsc::Sender<Fragment>,
}

impl FragmentEmitter {
    /// Returns a handle that tags fragments with `stage_name`.
    pub fn for_stage(&self, stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            tx: self.tx.clone(),
        }
    }

    /// Name fragments from this handle are tagged with.
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Emits a text fragment.
    pub async fn text(&self, text: impl Into<String>) {
        self.send(Fragment::text(self.stage_name.clone(), text)).await;
    }

    /// Emits a binary fragment.
    pub async fn binary(&self, bytes: Vec<u8>, mime_type: impl Into<String>) {
        self.send(Fragment::binary(self.stage_name.clone(), bytes, mime_type))
            .await;
    }

    /// Emits a prebuilt fragment. Its stage name is replaced by this handle's tag.
    pub async fn emit(&self, mut fragment: Fragment) {
        fragment.stage_name = self.stage_name.clone();
        self.send(fragment).await;
    }

    async fn send(&self, fragment: Fragment) {
        if self.tx.send(fragment).await.is_err() {
            // Consumer dropped the stream; the run still completes.
            debug!(stage = %self.stage_name, "Event stream closed, fragment dropped");
        }
    }
}

/// The receiving half: a finite, ordered stream of fragments.
///
/// Not restartable. Ends once the run has finished and every emitter is gone.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<Fragment>,
}

impl Stream for EventStream {
    type Item = Fragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
