//! # callkit-realtime
//!
//! Realtime voice calls against a speech model over WebRTC.
//!
//! The crate negotiates one call at a time: it captures the microphone, opens
//! a peer transport with an outbound audio track, an inbound audio line and an
//! ordered `oai-events` side-channel, trades an SDP offer for an answer over
//! HTTP with a short-lived session credential, and publishes the call's state
//! (status, transcripts, mute, input level) to any number of observers.
//!
//! ## Architecture
//!
//! ```text
//!   TokenProvider ──credential──┐
//!                               ▼
//!   MediaDevices ──track──▶ Negotiator ──offer/answer──▶ SignalingClient
//!                               │
//!                 TransportFactory / PeerTransport
//!                     │                    │
//!              remote audio          side-channel events
//!                     ▼                    ▼
//!                AudioOutput        ConnectionState (watch)
//! ```
//!
//! Every collaborator is a trait so backends can be swapped. The `webrtc`
//! feature provides a str0m transport with Opus media, and `desktop-audio`
//! provides cpal capture and playback.
//!
//! ## Example
//!
//! ```rust,ignore
//! use callkit_realtime::{
//!     CallConfig, CallSession, HttpSignaling, HttpTokenProvider, Negotiator, SessionRequest,
//! };
//! use callkit_realtime::devices::{CpalDevices, CpalOutput};
//! use callkit_realtime::webrtc::Str0mTransportFactory;
//!
//! let config = CallConfig::from_env()?;
//! let negotiator = Negotiator::builder()
//!     .devices(CpalDevices::new())
//!     .transports(Str0mTransportFactory::new())
//!     .signaling(HttpSignaling::from_config(&config))
//!     .output(CpalOutput::new())
//!     .build()?;
//!
//! let call = CallSession::new(
//!     negotiator,
//!     HttpTokenProvider::from_config(&config),
//!     SessionRequest::from_config(&config),
//! );
//! call.start().await;
//!
//! let mut state = call.subscribe();
//! while state.changed().await.is_ok() {
//!     let s = state.borrow_and_update().clone();
//!     println!("[{}] {} / {}", s.status, s.transcript, s.ai_response);
//! }
//! ```

pub mod call;
pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod level;
pub mod negotiator;
pub mod signaling;
pub mod state;
pub mod token;
pub mod transport;

// Backends
#[cfg(feature = "webrtc")]
pub mod webrtc;

#[cfg(feature = "desktop-audio")]
pub mod devices;

// Re-exports
pub use call::{CallSession, format_call_duration};
pub use capture::{
    AudioFrame, AudioTrack, CaptureGuard, CaptureStream, DeviceInfo, DeviceKind, MediaDevices,
    PermissionStatus,
};
pub use config::{CallConfig, Voice};
pub use diagnostics::{DiagnosticsReport, run_diagnostics};
pub use error::{CallError, Result};
pub use events::{ClientEvent, ServerEvent};
pub use level::{AnalysisContext, FrequencyAnalyser, LevelMonitor};
pub use negotiator::{Negotiator, NegotiatorBuilder};
pub use signaling::{HttpSignaling, SignalingClient};
pub use state::{ConnectionState, ConnectionStatus};
pub use token::{HttpTokenProvider, SessionCredential, SessionRequest, TokenProvider};
pub use transport::{
    AudioOutput, ChannelEvent, DiscardOutput, PeerTransport, RemoteAudio, RemoteTrackHandler,
    SdpType, SessionDescription, SideChannel, SideChannelHandle, TransportConfig, TransportFactory,
};
