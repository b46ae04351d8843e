//! Assembled view of a drained event stream.

use crate::events::{Fragment, FragmentPayload};
use serde::{Deserialize, Serialize};

/// A binary fragment kept as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryArtifact {
    pub stage_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Everything a run streamed, grouped for presentation.
///
/// Text is concatenated per producing task, in the order tasks first spoke;
/// binary payloads are kept as artifacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    sections: Vec<(String, String)>,
    artifacts: Vec<BinaryArtifact>,
    fragments: Vec<Fragment>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fragment in arrival order.
    pub fn push(&mut self, fragment: Fragment) {
        match &fragment.payload {
            FragmentPayload::Text(text) => {
                match self
                    .sections
                    .iter_mut()
                    .find(|(stage, _)| *stage == fragment.stage_name)
                {
                    Some((_, section)) => section.push_str(text),
                    None => self
                        .sections
                        .push((fragment.stage_name.clone(), text.clone())),
                }
            }
            FragmentPayload::Binary(bytes) => self.artifacts.push(BinaryArtifact {
                stage_name: fragment.stage_name.clone(),
                mime_type: fragment
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                bytes: bytes.clone(),
            }),
        }
        self.fragments.push(fragment);
    }

    /// Concatenated text of one task.
    pub fn text_for(&self, stage_name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(stage, _)| stage == stage_name)
            .map(|(_, text)| text.as_str())
    }

    /// `(task, text)` pairs in first-seen order.
    pub fn sections(&self) -> &[(String, String)] {
        &self.sections
    }

    pub fn artifacts(&self) -> &[BinaryArtifact] {
        &self.artifacts
    }

    /// Every fragment in arrival order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Renders all text as markdown, one heading per task.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for (stage, text) in &self.sections {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str("## ");
            out.push_str(stage);
            out.push_str("\n\n");
            out.push_str(text.trim_end());
        }
        out
    }
}

impl FromIterator<Fragment> for Transcript {
    fn from_iter<I: IntoIterator<Item = Fragment>>(iter: I) -> Self {
        let mut transcript = Transcript::new();
        for fragment in iter {
            transcript.push(fragment);
        }
        transcript
    }
}

impl Extend<Fragment> for Transcript {
    fn extend<I: IntoIterator<Item = Fragment>>(&mut self, iter: I) {
        for fragment in iter {
            self.push(fragment);
        }
    }
}
