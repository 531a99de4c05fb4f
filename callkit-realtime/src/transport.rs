//! Peer transport seam.
//!
//! The negotiator drives a transport only through these traits, so the real
//! str0m backend (feature `webrtc`) and in-process fakes are interchangeable.

use crate::capture::{AudioFrame, AudioTrack};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the handshake a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Transport construction parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// ICE server URLs; at least one is expected.
    pub ice_servers: Vec<String>,
}

impl TransportConfig {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

/// Notifications from an event side-channel, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and usable.
    Open,
    /// A text message arrived.
    Message(String),
    /// The channel reported an error. The call survives this.
    Error(String),
    /// The channel closed.
    Closed,
    /// The underlying transport failed; the call cannot continue.
    TransportFailed(String),
}

/// Sending half of an event side-channel.
pub trait SideChannelHandle: Send + Sync {
    fn label(&self) -> &str;

    /// Send a text message.
    fn send_text(&self, text: String) -> Result<()>;

    /// Close the channel. Safe to call more than once.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An ordered, reliable side-channel: a handle plus its event stream.
pub struct SideChannel {
    pub handle: Arc<dyn SideChannelHandle>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Remote audio arriving from the peer.
pub struct RemoteAudio {
    pub stream_id: String,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Called once per remote audio stream.
pub type RemoteTrackHandler = Arc<dyn Fn(RemoteAudio) + Send + Sync>;

/// A peer-to-peer media and data transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for outbound audio.
    fn add_track(&self, track: Arc<AudioTrack>) -> Result<()>;

    /// Declare an inbound-only audio line so remote audio is always negotiated.
    fn add_recv_only_audio(&self) -> Result<()>;

    /// Open an ordered, reliable side-channel.
    fn create_side_channel(&self, label: &str) -> Result<SideChannel>;

    /// Produce the local offer. Candidates are gathered up front (non-trickle).
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Close the transport. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        on_remote_track: RemoteTrackHandler,
    ) -> Result<Arc<dyn PeerTransport>>;
}

/// Plays remote audio.
pub trait AudioOutput: Send + Sync {
    /// Start playback immediately. Must not block.
    fn play(&self, audio: RemoteAudio) -> Result<()>;
}

/// Output that drains remote audio without playing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardOutput;

impl AudioOutput for DiscardOutput {
    fn play(&self, audio: RemoteAudio) -> Result<()> {
        let RemoteAudio { stream_id, mut frames } = audio;
        tokio::spawn(async move {
            let mut received = 0usize;
            while frames.recv().await.is_some() {
                received += 1;
            }
            tracing::debug!(stream.id = %stream_id, frames = received, "remote audio stream ended");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_serialises_like_browser_form() {
        let value = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(value, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[tokio::test]
    async fn test_discard_output_drains_frames() {
        let (tx, rx) = mpsc::channel(4);
        DiscardOutput.play(RemoteAudio { stream_id: "remote".into(), frames: rx }).unwrap();
        for _ in 0..8 {
            tx.send(AudioFrame::new(vec![0.0; 480], 48_000)).await.unwrap();
        }
        drop(tx);
    }
}
