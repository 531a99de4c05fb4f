//! Side-channel event protocol.
//!
//! The remote endpoint sends JSON text messages tagged by `type`. Only two kinds
//! change published state; everything else decodes to [`ServerEvent::Unknown`]
//! and is ignored.

use crate::error::{CallError, Result};
use crate::state::ConnectionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Server Events ───────────────────────────────────────────────────────

/// Events received from the remote endpoint over the side-channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The local speaker's utterance was transcribed.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    /// A response finished; its output carries the spoken transcript.
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseObject,
    },

    /// Older flat transcript event.
    #[serde(rename = "transcript")]
    Transcript {
        #[serde(default)]
        text: Option<String>,
    },

    /// Older flat response event.
    #[serde(rename = "response")]
    Response {
        #[serde(default)]
        text: Option<String>,
    },

    /// Error reported by the remote endpoint.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorInfo,
    },

    /// Any other kind.
    #[serde(other)]
    Unknown,
}

/// The `response` object of a `response.done` event.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResponseObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

impl ResponseObject {
    /// First transcript in `output[*].content[*]`, falling back to the first text
    /// part.
    pub fn transcript(&self) -> Option<&str> {
        let parts = || self.output.iter().flat_map(|item| item.content.iter());
        parts()
            .find_map(|part| part.transcript.as_deref())
            .or_else(|| parts().find_map(|part| part.text.as_deref()))
    }
}

/// One output item of a response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OutputItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// A content part within an output item.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Error payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ServerEvent {
    /// Decode one side-channel message.
    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Fold the event into `state`. Returns whether anything changed.
    ///
    /// Each recognised event overwrites its field, so the state always reflects
    /// the latest event of each kind.
    pub fn apply(&self, state: &mut ConnectionState) -> bool {
        match self {
            Self::InputTranscriptCompleted { transcript, .. } => {
                state.transcript = transcript.clone();
                true
            }
            // Legacy events may carry `"text": null`, which reads as empty.
            Self::Transcript { text } => {
                state.transcript = text.clone().unwrap_or_default();
                true
            }
            Self::Response { text } => {
                state.ai_response = text.clone().unwrap_or_default();
                true
            }
            Self::ResponseDone { response } => match response.transcript() {
                Some(text) => {
                    state.ai_response = text.to_string();
                    true
                }
                None => false,
            },
            Self::Error { error } => {
                tracing::warn!(
                    error.code = error.code.as_deref().unwrap_or(""),
                    error.message = %error.message,
                    "remote endpoint reported an error"
                );
                false
            }
            Self::Unknown => false,
        }
    }
}

// ── Client Events ───────────────────────────────────────────────────────

/// Events sent to the remote endpoint over the side-channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration.
    #[serde(rename = "session.update")]
    SessionUpdate { session: Value },

    /// Ask for a response, optionally with per-response overrides.
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },

    /// Interrupt the current response.
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Serialise for the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CallError::Unknown(e.to_string()))
    }
}
