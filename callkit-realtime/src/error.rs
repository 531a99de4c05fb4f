//! Error types for voice call negotiation.

use thiserror::Error;

/// Result type for call operations.
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors that can occur while setting up or running a voice call.
///
/// The type is `Clone + PartialEq` because the most recent error is part of the
/// published [`ConnectionState`](crate::state::ConnectionState).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The user (or the platform) refused microphone access.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// An HTTP exchange (token or SDP) returned a non-success status.
    #[error("Signaling failed with status {status}: {body}")]
    SignalingFailed {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The token service answered with `errorCode != 0`.
    #[error("API Error: {message} (errorCode {code})")]
    SessionRejected {
        /// Application-level error code.
        code: i64,
        /// Reason reported by the service.
        message: String,
    },

    /// The token envelope did not honour its contract.
    #[error("Invalid response: {0}")]
    EnvelopeInvalid(String),

    /// The request never produced an HTTP response.
    #[error("Network error: {0}")]
    Network(String),

    /// Peer transport setup or runtime failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The event side-channel reported an error. Not fatal on its own.
    #[error("Side channel error: {0}")]
    SideChannel(String),

    /// Audio format or codec error.
    #[error("Audio format error: {0}")]
    AudioFormat(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation requires an established side-channel.
    #[error("Call not connected")]
    NotConnected,

    /// A failure that carried no typed error.
    #[error("{0}")]
    Unknown(String),
}

impl CallError {
    /// Create a new permission error.
    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    /// Create a new signaling error from an HTTP status and body.
    pub fn signaling<S: Into<String>>(status: u16, body: S) -> Self {
        Self::SignalingFailed { status, body: body.into() }
    }

    /// Create a new envelope contract error.
    pub fn envelope<S: Into<String>>(reason: S) -> Self {
        Self::EnvelopeInvalid(reason.into())
    }

    /// Create a new network error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new audio format error.
    pub fn audio<S: Into<String>>(msg: S) -> Self {
        Self::AudioFormat(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an untyped failure. The value is rendered as JSON so nested
    /// structure survives into the human-readable message.
    pub fn unknown<T: serde::Serialize + std::fmt::Debug>(raw: &T) -> Self {
        match serde_json::to_string(raw) {
            Ok(json) => Self::Unknown(json),
            Err(_) => Self::Unknown(format!("{raw:?}")),
        }
    }

    /// Whether this error ends the call attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SideChannel(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::SignalingFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::signaling(status.as_u16(), err.to_string()),
            None => Self::network(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for CallError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Unknown(format!("background task failed: {err}"))
    }
}
