//! Published connection state and its transition rules.

use crate::error::CallError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// `connect` is running.
    Connecting,
    /// The event side-channel opened.
    Connected,
    /// Torn down by `disconnect`.
    Disconnected,
    /// A fatal error ended the attempt; see [`ConnectionState::error`].
    Error,
}

impl ConnectionStatus {
    /// Whether the state machine permits `self -> next`.
    ///
    /// `Disconnected` is reachable from anywhere because `disconnect` must be
    /// callable in every state. Staying in the same state is not a transition.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Error)
                | (Error, Connecting)
                | (Disconnected, Connecting)
                | (Idle | Connecting | Connected | Error, Disconnected)
        )
    }

    /// `true` for `Connecting` and `Connected`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of everything the call surface renders.
///
/// `error` is normally only present in [`ConnectionStatus::Error`]. The one
/// exception is a side-channel error while connected, which is reported without
/// ending the call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error: Option<CallError>,
    /// Last completed transcript of the local speaker.
    pub transcript: String,
    /// Last completed reply of the remote party.
    pub ai_response: String,
    /// Inverse of the local track's enabled flag.
    pub is_muted: bool,
    /// Normalised input level in `[0, 1]`.
    pub audio_level: f32,
    /// When the side-channel opened for the current call.
    pub connected_at: Option<Instant>,
}

impl ConnectionState {
    /// Human-readable error, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Whether the call surface must show its error affordance.
    pub fn needs_attention(&self) -> bool {
        self.status == ConnectionStatus::Error || self.error.is_some()
    }
}

/// Single-writer cell that publishes [`ConnectionState`] to any number of readers.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::default());
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn snapshot(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.tx.borrow().status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a transition if the state machine allows it. Returns whether the
    /// status changed.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|state| apply_transition(state, next))
    }

    /// Move to `Error` carrying `error`.
    pub(crate) fn fail(&self, error: CallError) -> bool {
        self.tx.send_if_modified(|state| {
            if !apply_transition(state, ConnectionStatus::Error) {
                return false;
            }
            state.error = Some(error);
            true
        })
    }

    /// Start a fresh attempt: `Connecting` with all call data reset.
    pub(crate) fn begin_attempt(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if !apply_transition(state, ConnectionStatus::Connecting) {
                return false;
            }
            state.transcript.clear();
            state.ai_response.clear();
            state.is_muted = false;
            state.audio_level = 0.0;
            true
        })
    }

    /// Mutate call data without touching `status`.
    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionState) -> bool,
    {
        self.tx.send_if_modified(f);
    }
}

fn apply_transition(state: &mut ConnectionState, next: ConnectionStatus) -> bool {
    let current = state.status;
    if current == next {
        return false;
    }
    if !current.can_transition_to(next) {
        tracing::warn!(from = %current, to = %next, "rejected connection state transition");
        return false;
    }

    tracing::debug!(from = %current, to = %next, "connection state transition");
    state.status = next;
    state.error = None;
    match next {
        ConnectionStatus::Connected => state.connected_at = Some(Instant::now()),
        ConnectionStatus::Connecting => state.connected_at = None,
        ConnectionStatus::Disconnected => {
            state.connected_at = None;
            state.is_muted = false;
            state.audio_level = 0.0;
        }
        ConnectionStatus::Error => state.audio_level = 0.0,
        ConnectionStatus::Idle => {}
    }
    true
}
