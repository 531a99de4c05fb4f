//! Microphone capture: tracks, streams and the capture guard.
//!
//! Capture backends push mono `f32` samples into an [`AudioTrack`]; consumers
//! (the level analyser, the peer transport) subscribe to the track's frame
//! broadcast. A disabled track keeps producing frames, filled with silence, the
//! same way a muted browser track keeps its stream alive.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Frames buffered per subscriber before the slowest one starts lagging.
const FRAME_BROADCAST_CAPACITY: usize = 64;

/// A chunk of mono PCM audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples in `[-1.0, 1.0]`.
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Create a frame from samples.
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self { samples: samples.into(), sample_rate }
    }

    /// Frame duration.
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

/// A local audio track.
pub struct AudioTrack {
    id: String,
    label: String,
    sample_rate: u32,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: Mutex<Option<broadcast::Sender<AudioFrame>>>,
    on_stop: Mutex<Option<StopHook>>,
}

impl AudioTrack {
    /// Create an enabled, live track.
    pub fn new(label: impl Into<String>, sample_rate: u32) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(FRAME_BROADCAST_CAPACITY);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            sample_rate,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames: Mutex::new(Some(tx)),
            on_stop: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Publish captured samples. Silence is published while disabled; nothing
    /// happens once the track is stopped.
    pub fn push(&self, samples: &[f32]) {
        let frames = self.frames.lock();
        let Some(tx) = frames.as_ref() else {
            return;
        };
        let samples: Arc<[f32]> = if self.is_enabled() {
            Arc::from(samples)
        } else {
            vec![0.0; samples.len()].into()
        };
        // No subscribers is fine.
        let _ = tx.send(AudioFrame { samples, sample_rate: self.sample_rate });
    }

    /// Subscribe to the frame broadcast. `None` once stopped.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.frames.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Register a hook that releases the underlying device when the track stops.
    /// Runs immediately if the track is already stopped.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.on_stop.lock();
        if !self.is_stopped() {
            *slot = Some(Box::new(hook));
            return;
        }
        drop(slot);
        hook();
    }

    /// Stop the track and release its device. Returns `true` only for the call
    /// that actually stopped it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the sender closes every subscriber.
        self.frames.lock().take();
        let hook = self.on_stop.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!(track.id = %self.id, track.label = %self.label, "audio track stopped");
        true
    }
}

impl fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("sample_rate", &self.sample_rate)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The tracks produced by one capture acquisition.
#[derive(Debug, Clone)]
pub struct CaptureStream {
    id: String,
    tracks: Vec<Arc<AudioTrack>>,
}

impl CaptureStream {
    pub fn new(tracks: Vec<Arc<AudioTrack>>) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_tracks(&self) -> &[Arc<AudioTrack>] {
        &self.tracks
    }

    pub fn first_audio_track(&self) -> Option<&Arc<AudioTrack>> {
        self.tracks.first()
    }

    /// Stop every track. Returns how many were actually stopped by this call.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Microphone permission as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Prompt,
    Unknown,
}

/// Direction of an audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
}

/// An enumerated audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

/// Source of local audio capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire the microphone.
    ///
    /// Implementations must release anything they partially acquired before
    /// returning an error, and map refusals to
    /// [`CallError::PermissionDenied`](crate::error::CallError::PermissionDenied)
    /// and missing hardware to
    /// [`CallError::DeviceUnavailable`](crate::error::CallError::DeviceUnavailable).
    async fn acquire_audio(&self) -> Result<CaptureStream>;

    /// Current microphone permission.
    async fn permission_status(&self) -> PermissionStatus {
        PermissionStatus::Unknown
    }

    /// Enumerate audio devices.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }
}

/// Exclusive owner of the held capture stream and its mute state.
#[derive(Debug, Default)]
pub struct CaptureGuard {
    stream: Option<CaptureStream>,
}

impl CaptureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `stream`, releasing any stream held before.
    pub fn hold(&mut self, stream: CaptureStream) {
        self.release();
        self.stream = Some(stream);
    }

    pub fn is_holding(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&CaptureStream> {
        self.stream.as_ref()
    }

    fn track(&self) -> Option<&Arc<AudioTrack>> {
        self.stream.as_ref().and_then(CaptureStream::first_audio_track)
    }

    /// Mute state derived from the track, `None` without a track.
    pub fn is_muted(&self) -> Option<bool> {
        self.track().map(|t| !t.is_enabled())
    }

    /// Flip the track's enabled flag. Returns the new mute state, or `None` when
    /// nothing is held.
    pub fn toggle_mute(&self) -> Option<bool> {
        let track = self.track()?;
        track.set_enabled(!track.is_enabled());
        Some(!track.is_enabled())
    }

    /// Set the mute state. Returns it back, or `None` when nothing is held.
    pub fn set_muted(&self, muted: bool) -> Option<bool> {
        let track = self.track()?;
        track.set_enabled(!muted);
        Some(!track.is_enabled())
    }

    /// Stop every held track and forget the stream. Returns how many tracks were
    /// stopped.
    pub fn release(&mut self) -> usize {
        match self.stream.take() {
            Some(stream) => stream.stop_all(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_disabled_track_publishes_silence() {
        let track = AudioTrack::new("mic", 48_000);
        let mut rx = track.subscribe().unwrap();

        track.push(&[0.5, -0.5]);
        track.set_enabled(false);
        track.push(&[0.5, -0.5]);

        assert_eq!(&*rx.try_recv().unwrap().samples, &[0.5, -0.5]);
        assert_eq!(&*rx.try_recv().unwrap().samples, &[0.0, 0.0]);
    }

    #[test]
    fn test_stop_runs_hook_once_and_closes_subscribers() {
        let track = AudioTrack::new("mic", 16_000);
        let mut rx = track.subscribe().unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        track.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(track.subscribe().is_none());
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Closed)));

        // pushing after stop is inert
        track.push(&[1.0]);
    }

    #[test]
    fn test_guard_toggle_twice_restores() {
        let track = AudioTrack::new("mic", 24_000);
        let mut guard = CaptureGuard::new();
        guard.hold(CaptureStream::new(vec![track.clone()]));

        assert_eq!(guard.is_muted(), Some(false));
        assert_eq!(guard.toggle_mute(), Some(true));
        assert!(!track.is_enabled());
        assert_eq!(guard.toggle_mute(), Some(false));
        assert!(track.is_enabled());
    }

    #[test]
    fn test_guard_without_stream_is_inert() {
        let mut guard = CaptureGuard::new();
        assert_eq!(guard.toggle_mute(), None);
        assert_eq!(guard.set_muted(true), None);
        assert_eq!(guard.release(), 0);
    }

    #[test]
    fn test_release_stops_each_track_once() {
        let tracks = vec![AudioTrack::new("a", 8_000), AudioTrack::new("b", 8_000)];
        let mut guard = CaptureGuard::new();
        guard.hold(CaptureStream::new(tracks.clone()));

        assert_eq!(guard.release(), 2);
        assert_eq!(guard.release(), 0);
        assert!(tracks.iter().all(|t| t.is_stopped()));
    }
}
