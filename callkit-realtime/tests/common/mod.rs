//! In-process fakes for the negotiator's collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use callkit_realtime::{
    AudioOutput, AudioTrack, CallError, CaptureStream, ChannelEvent, ConnectionState,
    ConnectionStatus, DeviceInfo, DeviceKind, MediaDevices, PeerTransport, PermissionStatus,
    RemoteAudio, RemoteTrackHandler, Result, SessionCredential, SessionDescription,
    SessionRequest, SideChannel, SideChannelHandle, SignalingClient, TokenProvider,
    TransportConfig, TransportFactory,
};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};

pub const FAKE_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
pub const FAKE_ANSWER: &str = "v=0\r\no=- 2 2 IN IP4 203.0.113.7\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

/// Route negotiator logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait until published state satisfies `pred`, failing the test after a second.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}

pub async fn wait_for_status(
    rx: &mut watch::Receiver<ConnectionState>,
    status: ConnectionStatus,
) -> ConnectionState {
    wait_for_state(rx, |s| s.status == status).await
}

// ── Devices ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CaptureBehaviour {
    Grant,
    Deny,
    NoDevice,
    /// Succeeds with a stream that has no tracks.
    Empty,
    /// Succeeds with a track that has already ended.
    Ended,
}

pub struct DevicesState {
    behaviour: CaptureBehaviour,
    pub acquired: Mutex<Vec<Arc<AudioTrack>>>,
    pub acquisitions: AtomicUsize,
}

/// Clones share state, so a test keeps one and hands the other to the builder.
#[derive(Clone)]
pub struct FakeDevices(Arc<DevicesState>);

impl Deref for FakeDevices {
    type Target = DevicesState;

    fn deref(&self) -> &DevicesState {
        &self.0
    }
}

impl FakeDevices {
    pub fn new(behaviour: CaptureBehaviour) -> Self {
        Self(Arc::new(DevicesState {
            behaviour,
            acquired: Mutex::new(Vec::new()),
            acquisitions: AtomicUsize::new(0),
        }))
    }

    pub fn granting() -> Self {
        Self::new(CaptureBehaviour::Grant)
    }

    pub fn last_track(&self) -> Option<Arc<AudioTrack>> {
        self.acquired.lock().last().cloned()
    }

    pub fn all_stopped(&self) -> bool {
        self.acquired.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_audio(&self) -> Result<CaptureStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            CaptureBehaviour::Grant => {
                let track = AudioTrack::new("Fake Microphone", 48_000);
                self.acquired.lock().push(track.clone());
                Ok(CaptureStream::new(vec![track]))
            }
            CaptureBehaviour::Deny => Err(CallError::permission("Permission denied")),
            CaptureBehaviour::NoDevice => Err(CallError::device("Requested device not found")),
            CaptureBehaviour::Empty => Ok(CaptureStream::new(Vec::new())),
            CaptureBehaviour::Ended => {
                let track = AudioTrack::new("Fake Microphone", 48_000);
                track.stop();
                self.acquired.lock().push(track.clone());
                Ok(CaptureStream::new(vec![track]))
            }
        }
    }

    async fn permission_status(&self) -> PermissionStatus {
        match self.behaviour {
            CaptureBehaviour::Deny => PermissionStatus::Denied,
            _ => PermissionStatus::Granted,
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![
            DeviceInfo { id: "in-0".into(), label: "Fake Microphone".into(), kind: DeviceKind::AudioInput },
            DeviceInfo { id: "out-0".into(), label: "Fake Speakers".into(), kind: DeviceKind::AudioOutput },
            DeviceInfo { id: "out-1".into(), label: "Fake Headset".into(), kind: DeviceKind::AudioOutput },
        ])
    }
}

// ── Transport ───────────────────────────────────────────────────────────

pub struct FakeChannel {
    label: String,
    pub sent: Mutex<Vec<String>>,
    pub close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl SideChannelHandle for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(CallError::transport("channel closed"));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    pub config: TransportConfig,
    pub on_remote_track: RemoteTrackHandler,
    pub tracks: Mutex<Vec<Arc<AudioTrack>>>,
    pub recv_only_lines: AtomicUsize,
    pub channel: Mutex<Option<Arc<FakeChannel>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub close_calls: AtomicUsize,
    closed: AtomicBool,
    open_on_answer: bool,
}

impl FakeTransport {
    /// Push a side-channel event as if it came from the peer.
    pub fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn message(&self, json: &str) {
        self.emit(ChannelEvent::Message(json.to_string()));
    }

    pub fn channel_close_calls(&self) -> usize {
        self.channel.lock().as_ref().map_or(0, |c| c.close_calls.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn add_track(&self, track: Arc<AudioTrack>) -> Result<()> {
        self.tracks.lock().push(track);
        Ok(())
    }

    fn add_recv_only_audio(&self) -> Result<()> {
        self.recv_only_lines.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_side_channel(&self, label: &str) -> Result<SideChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeChannel {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        *self.channel.lock() = Some(handle.clone());
        *self.events.lock() = Some(tx);
        Ok(SideChannel { handle, events: rx })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(FAKE_OFFER))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(description);
        if self.open_on_answer {
            self.emit(ChannelEvent::Open);
        }
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct TransportsState {
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
    open_on_answer: bool,
    fail_with: Option<CallError>,
}

#[derive(Clone)]
pub struct FakeTransports(Arc<TransportsState>);

impl Deref for FakeTransports {
    type Target = TransportsState;

    fn deref(&self) -> &TransportsState {
        &self.0
    }
}

impl FakeTransports {
    fn with(open_on_answer: bool, fail_with: Option<CallError>) -> Self {
        Self(Arc::new(TransportsState { created: Mutex::new(Vec::new()), open_on_answer, fail_with }))
    }

    pub fn new() -> Self {
        Self::with(true, None)
    }

    /// Transports whose side-channel never opens on its own.
    pub fn silent() -> Self {
        Self::with(false, None)
    }

    pub fn failing(error: CallError) -> Self {
        Self::with(true, Some(error))
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created.lock().last().cloned().expect("no transport created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransports {
    async fn create(
        &self,
        config: &TransportConfig,
        on_remote_track: RemoteTrackHandler,
    ) -> Result<Arc<dyn PeerTransport>> {
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        let transport = Arc::new(FakeTransport {
            config: config.clone(),
            on_remote_track,
            tracks: Mutex::new(Vec::new()),
            recv_only_lines: AtomicUsize::new(0),
            channel: Mutex::new(None),
            events: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            open_on_answer: self.open_on_answer,
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

// ── Signaling ───────────────────────────────────────────────────────────

pub struct SignalingState {
    pub bearers: Mutex<Vec<String>>,
    pub offers: Mutex<Vec<SessionDescription>>,
    result: std::result::Result<String, CallError>,
    gate: Option<Arc<Notify>>,
}

#[derive(Clone)]
pub struct FakeSignaling(Arc<SignalingState>);

impl Deref for FakeSignaling {
    type Target = SignalingState;

    fn deref(&self) -> &SignalingState {
        &self.0
    }
}

impl FakeSignaling {
    fn with(result: std::result::Result<String, CallError>, gate: Option<Arc<Notify>>) -> Self {
        Self(Arc::new(SignalingState {
            bearers: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            result,
            gate,
        }))
    }

    pub fn answering() -> Self {
        Self::with(Ok(FAKE_ANSWER.to_string()), None)
    }

    pub fn failing(error: CallError) -> Self {
        Self::with(Err(error), None)
    }

    /// Holds each exchange until `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self::with(Ok(FAKE_ANSWER.to_string()), Some(gate))
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    async fn exchange(
        &self,
        credential: &SessionCredential,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        self.bearers.lock().push(credential.expose_secret().to_string());
        self.offers.lock().push(offer.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result.clone().map(SessionDescription::answer)
    }
}

// ── Output ──────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeOutput {
    pub streams: Arc<Mutex<Vec<String>>>,
}

impl AudioOutput for FakeOutput {
    fn play(&self, audio: RemoteAudio) -> Result<()> {
        self.streams.lock().push(audio.stream_id);
        Ok(())
    }
}

// ── Tokens ──────────────────────────────────────────────────────────────

/// Issues `tok_1`, `tok_2`, ... or a fixed error.
#[derive(Clone, Default)]
pub struct FakeTokens {
    pub requests: Arc<Mutex<Vec<SessionRequest>>>,
    fail_with: Option<CallError>,
}

impl FakeTokens {
    pub fn failing(error: CallError) -> Self {
        Self { fail_with: Some(error), ..Default::default() }
    }

    pub fn issued(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCredential> {
        let issued = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => SessionCredential::new(format!("tok_{issued}")),
        }
    }
}

pub fn credential(secret: &str) -> SessionCredential {
    SessionCredential::new(secret).expect("non-empty secret")
}
