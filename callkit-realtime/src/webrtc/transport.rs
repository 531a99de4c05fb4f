//! Peer transport on str0m.
//!
//! str0m is Sans-IO: the `Rtc` state machine is fed from a tokio UDP socket by a
//! driver task started once the answer is accepted. The driver also encodes the
//! local track to Opus, decodes remote audio, and turns data channel events into
//! [`ChannelEvent`]s.
//!
//! ICE is non-trickle: a single host candidate on the outbound interface is added
//! before the offer is produced.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use str0m::change::{SdpAnswer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid, Pt};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::opus::OpusCodec;
use crate::capture::{AudioFrame, AudioTrack};
use crate::error::{CallError, Result};
use crate::transport::{
    ChannelEvent, PeerTransport, RemoteAudio, RemoteTrackHandler, SdpType, SessionDescription,
    SideChannel, SideChannelHandle, TransportConfig, TransportFactory,
};

/// Messages queued on a side-channel before it opens.
const MAX_PENDING_MESSAGES: usize = 50;

/// Decoded remote frames buffered for playback.
const REMOTE_FRAME_BUFFER: usize = 64;

/// Remote audio is decoded at the Opus RTP clock.
const REMOTE_SAMPLE_RATE: u32 = 48_000;

/// Largest UDP datagram read from the socket.
const RECV_BUFFER_BYTES: usize = 2000;

/// Creates [`Str0mTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct Str0mTransportFactory {
    bind_addr: Option<SocketAddr>,
}

impl Str0mTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to a fixed address instead of discovering the outbound interface.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }
}

/// Host and port of a `stun:`/`turn:` URL.
fn ice_server_host(url: &str) -> Option<String> {
    let rest = url.split_once(':')?.1.trim_start_matches("//");
    let host = rest.split('?').next()?;
    if host.is_empty() {
        return None;
    }
    if host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Some(host.to_string())
    } else {
        Some(format!("{host}:3478"))
    }
}

/// Local IP the OS would use to reach the first ICE server.
async fn outbound_ip(ice_servers: &[String]) -> Result<IpAddr> {
    let target = ice_servers
        .iter()
        .find_map(|url| ice_server_host(url))
        .ok_or_else(|| CallError::transport("no usable ICE server to route towards"))?;
    let probe = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| CallError::transport(format!("failed to bind probe socket: {e}")))?;
    probe
        .connect(&target)
        .await
        .map_err(|e| CallError::transport(format!("failed to route towards {target}: {e}")))?;
    let addr = probe
        .local_addr()
        .map_err(|e| CallError::transport(format!("failed to read local address: {e}")))?;
    Ok(addr.ip())
}

#[async_trait]
impl TransportFactory for Str0mTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        on_remote_track: RemoteTrackHandler,
    ) -> Result<Arc<dyn PeerTransport>> {
        let bind_addr = match self.bind_addr {
            Some(addr) => addr,
            None => SocketAddr::new(outbound_ip(&config.ice_servers).await?, 0),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| CallError::transport(format!("failed to bind {bind_addr}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| CallError::transport(format!("failed to read local address: {e}")))?;

        let mut rtc = Rtc::new(Instant::now());
        let candidate = Candidate::host(local_addr, "udp")
            .map_err(|e| CallError::transport(format!("invalid host candidate {local_addr}: {e}")))?;
        rtc.add_local_candidate(candidate);

        tracing::debug!(%local_addr, "created str0m transport");

        Ok(Arc::new(Str0mTransport {
            shared: Arc::new(Shared {
                rtc: Mutex::new(rtc),
                socket: Arc::new(socket),
                setup: Mutex::new(Setup::default()),
                channels: Mutex::new(HashMap::new()),
                on_remote_track,
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

/// Negotiation state collected before the offer is produced.
#[derive(Default)]
struct Setup {
    track: Option<Arc<AudioTrack>>,
    recv_audio: bool,
    unbound: Vec<Arc<Str0mChannel>>,
    pending: Option<SdpPendingOffer>,
    offer_sdp: Option<String>,
    local_committed: bool,
    audio_mid: Option<Mid>,
    started: bool,
}

struct Shared {
    rtc: Mutex<Rtc>,
    socket: Arc<UdpSocket>,
    setup: Mutex<Setup>,
    channels: Mutex<HashMap<ChannelId, Arc<Str0mChannel>>>,
    on_remote_track: RemoteTrackHandler,
    wake: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    /// Drain `Rtc` output until it asks for a timeout.
    fn poll(&self) -> Result<(Vec<str0m::net::Transmit>, Vec<Event>, Instant)> {
        let mut rtc = self.rtc.lock();
        let mut transmits = Vec::new();
        let mut events = Vec::new();
        loop {
            match rtc.poll_output().map_err(|e| CallError::transport(format!("rtc poll failed: {e}")))? {
                Output::Timeout(deadline) => return Ok((transmits, events, deadline)),
                Output::Transmit(transmit) => transmits.push(transmit),
                Output::Event(event) => events.push(event),
            }
        }
    }

    fn handle_input(&self, input: Input<'_>) -> Result<()> {
        self.rtc
            .lock()
            .handle_input(input)
            .map_err(|e| CallError::transport(format!("rtc input rejected: {e}")))
    }

    fn broadcast(&self, event: ChannelEvent) {
        for channel in self.channels.lock().values() {
            channel.emit(event.clone());
        }
    }
}

/// str0m-backed [`PeerTransport`].
pub struct Str0mTransport {
    shared: Arc<Shared>,
}

impl Str0mTransport {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared
            .socket
            .local_addr()
            .map_err(|e| CallError::transport(format!("failed to read local address: {e}")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CallError::transport("transport is closed"));
        }
        Ok(())
    }

    fn ensure_unnegotiated(setup: &Setup) -> Result<()> {
        if setup.offer_sdp.is_some() {
            return Err(CallError::transport("offer already created; renegotiation is not supported"));
        }
        Ok(())
    }

    /// Negotiated Opus payload type and clock for the audio line.
    fn audio_params(&self, mid: Mid) -> Result<(Pt, Frequency)> {
        let mut rtc = self.shared.rtc.lock();
        let writer = rtc
            .writer(mid)
            .ok_or_else(|| CallError::transport("audio writer not available after answer"))?;
        let params = writer
            .payload_params()
            .next()
            .ok_or_else(|| CallError::transport("no audio payload type negotiated"))?;
        Ok((params.pt(), params.spec().clock_rate))
    }
}

#[async_trait]
impl PeerTransport for Str0mTransport {
    fn add_track(&self, track: Arc<AudioTrack>) -> Result<()> {
        self.ensure_open()?;
        // fail early on rates the encoder cannot take
        OpusCodec::new(track.sample_rate())?;
        let mut setup = self.shared.setup.lock();
        Self::ensure_unnegotiated(&setup)?;
        setup.track = Some(track);
        Ok(())
    }

    /// Folded into the single audio line: `SendRecv` with a local track,
    /// `RecvOnly` without one.
    fn add_recv_only_audio(&self) -> Result<()> {
        self.ensure_open()?;
        let mut setup = self.shared.setup.lock();
        Self::ensure_unnegotiated(&setup)?;
        setup.recv_audio = true;
        Ok(())
    }

    fn create_side_channel(&self, label: &str) -> Result<SideChannel> {
        self.ensure_open()?;
        let mut setup = self.shared.setup.lock();
        Self::ensure_unnegotiated(&setup)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Str0mChannel {
            label: label.to_string(),
            id: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            shared: Arc::downgrade(&self.shared),
            events: tx,
        });
        setup.unbound.push(channel.clone());
        Ok(SideChannel { handle: channel, events: rx })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let mut setup = self.shared.setup.lock();
        Self::ensure_unnegotiated(&setup)?;

        let direction = if setup.track.is_some() { Direction::SendRecv } else { Direction::RecvOnly };
        let mut rtc = self.shared.rtc.lock();
        let mut changes = rtc.sdp_api();
        let mid = (setup.track.is_some() || setup.recv_audio)
            .then(|| changes.add_media(MediaKind::Audio, direction, None, None, None));
        let mut bound = Vec::with_capacity(setup.unbound.len());
        for channel in setup.unbound.drain(..) {
            let id = changes.add_channel(channel.label.clone());
            *channel.id.lock() = Some(id);
            bound.push((id, channel));
        }
        let (offer, pending) = changes
            .apply()
            .ok_or_else(|| CallError::transport("nothing to negotiate: no audio line or channel"))?;
        drop(rtc);

        self.shared.channels.lock().extend(bound);
        let sdp = offer.to_sdp_string();
        setup.audio_mid = mid;
        setup.pending = Some(pending);
        setup.offer_sdp = Some(sdp.clone());

        tracing::debug!(audio_mid = ?mid, ?direction, "generated local SDP offer");
        Ok(SessionDescription::offer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let mut setup = self.shared.setup.lock();
        match &setup.offer_sdp {
            Some(sdp) if description.sdp_type == SdpType::Offer && *sdp == description.sdp => {
                setup.local_committed = true;
                Ok(())
            }
            Some(_) => Err(CallError::transport("local description does not match the created offer")),
            None => Err(CallError::transport("no offer has been created")),
        }
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if description.sdp_type != SdpType::Answer {
            return Err(CallError::transport("remote description must be an answer"));
        }

        let (pending, mid, track) = {
            let mut setup = self.shared.setup.lock();
            if !setup.local_committed {
                return Err(CallError::transport("local description not set"));
            }
            let pending = setup
                .pending
                .take()
                .ok_or_else(|| CallError::transport("answer already applied"))?;
            setup.started = true;
            (pending, setup.audio_mid, setup.track.clone())
        };

        let answer = SdpAnswer::from_sdp_string(&description.sdp)
            .map_err(|e| CallError::transport(format!("failed to parse SDP answer: {e}")))?;
        self.shared
            .rtc
            .lock()
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| CallError::transport(format!("failed to apply SDP answer: {e}")))?;

        let outbound = match (mid, track) {
            (Some(mid), Some(track)) => {
                let (pt, clock) = self.audio_params(mid)?;
                let codec = OpusCodec::new(track.sample_rate())?;
                track.subscribe().map(|frames| Outbound {
                    frames,
                    codec,
                    mid,
                    pt,
                    clock,
                    buffer: Vec::new(),
                    rtp_offset: 0,
                })
            }
            _ => None,
        };

        tracing::info!(audio_mid = ?mid, "SDP answer applied; starting transport driver");
        tokio::spawn(drive(self.shared.clone(), outbound));
        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.rtc.lock().disconnect();
        for channel in self.shared.channels.lock().values() {
            channel.mark_closed();
        }
        tracing::debug!("str0m transport closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for Str0mTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Side-channel ────────────────────────────────────────────────────────

/// A str0m data channel. Messages sent before it opens are queued.
pub struct Str0mChannel {
    label: String,
    id: Mutex<Option<ChannelId>>,
    open: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<Vec<String>>,
    shared: Weak<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Str0mChannel {
    fn emit(&self, event: ChannelEvent) {
        if !self.is_closed() {
            // receiver gone means the negotiator already let go
            let _ = self.events.send(event);
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
    }

    fn write(&self, shared: &Shared, text: &str) -> Result<()> {
        let id = (*self.id.lock())
            .ok_or_else(|| CallError::SideChannel(format!("channel '{}' not negotiated", self.label)))?;
        let mut rtc = shared.rtc.lock();
        let mut channel = rtc
            .channel(id)
            .ok_or_else(|| CallError::SideChannel(format!("channel '{}' not available", self.label)))?;
        channel
            .write(false, text.as_bytes())
            .map_err(|e| CallError::SideChannel(format!("channel write failed: {e}")))?;
        Ok(())
    }

    /// Called by the driver when str0m reports the channel open.
    fn on_open(&self, shared: &Shared) {
        self.open.store(true, Ordering::Release);
        let pending: Vec<String> = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "side channel open; flushing queued messages");
        }
        for text in pending {
            if let Err(e) = self.write(shared, &text) {
                tracing::warn!(error = %e, "failed to flush queued side-channel message");
            }
        }
        self.emit(ChannelEvent::Open);
    }
}

impl SideChannelHandle for Str0mChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(CallError::SideChannel(format!("channel '{}' is closed", self.label)));
        }
        let shared = self.shared.upgrade().ok_or(CallError::NotConnected)?;

        if !self.open.load(Ordering::Acquire) {
            let mut pending = self.pending.lock();
            if pending.len() >= MAX_PENDING_MESSAGES {
                return Err(CallError::SideChannel(format!(
                    "channel queue full ({MAX_PENDING_MESSAGES} messages); channel may not be opening"
                )));
            }
            pending.push(text);
            tracing::debug!(pending = pending.len(), "side channel not open yet; message queued");
            return Ok(());
        }

        self.write(&shared, &text)?;
        shared.wake.notify_one();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.lock().clear();
        let _ = self.events.send(ChannelEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ── Driver ──────────────────────────────────────────────────────────────

/// Outbound audio state: local track frames, Opus encoder and RTP clock.
struct Outbound {
    frames: broadcast::Receiver<AudioFrame>,
    codec: OpusCodec,
    mid: Mid,
    pt: Pt,
    clock: Frequency,
    buffer: Vec<f32>,
    rtp_offset: u64,
}

impl Outbound {
    /// Encode and queue every complete 20 ms frame.
    fn write(&mut self, shared: &Shared, frame: &AudioFrame) -> Result<()> {
        self.buffer.extend_from_slice(&frame.samples);
        let frame_len = self.codec.frame_samples();
        let rate = u64::from(self.codec.sample_rate());
        let clock = u64::from(self.clock.get());

        while self.buffer.len() >= frame_len {
            let chunk: Vec<f32> = self.buffer.drain(..frame_len).collect();
            let packet = self.codec.encode_f32(&chunk)?;

            let mut rtc = shared.rtc.lock();
            let writer = rtc
                .writer(self.mid)
                .ok_or_else(|| CallError::transport("audio writer not available"))?;
            writer
                .write(self.pt, Instant::now(), MediaTime::new(self.rtp_offset, self.clock), packet)
                .map_err(|e| CallError::transport(format!("audio write failed: {e}")))?;
            self.rtp_offset += frame_len as u64 * clock / rate;
        }
        Ok(())
    }
}

async fn next_frame(outbound: &mut Option<Outbound>) -> Option<AudioFrame> {
    let Some(out) = outbound.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match out.frames.recv().await {
            Ok(frame) => return Some(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::trace!(skipped, "outbound audio lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Inbound audio state: created on the first media packet.
struct Inbound {
    codec: OpusCodec,
    frames: mpsc::Sender<AudioFrame>,
}

async fn drive(shared: Arc<Shared>, mut outbound: Option<Outbound>) {
    let socket = shared.socket.clone();
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            shared.broadcast(ChannelEvent::TransportFailed(format!("socket unusable: {e}")));
            return;
        }
    };
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    let mut inbound: Option<Inbound> = None;

    loop {
        let (transmits, events, deadline) = match shared.poll() {
            Ok(output) => output,
            Err(e) => {
                shared.broadcast(ChannelEvent::TransportFailed(e.to_string()));
                break;
            }
        };

        for transmit in transmits {
            if let Err(e) = socket.send_to(&transmit.contents, transmit.destination).await {
                tracing::warn!(destination = %transmit.destination, error = %e, "UDP send failed");
            }
        }

        for event in events {
            if !dispatch(&shared, event, &mut inbound) {
                shared.cancel.cancel();
            }
        }

        let sleep = tokio::time::sleep_until(deadline.into());
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = sleep => {
                if let Err(e) = shared.handle_input(Input::Timeout(Instant::now())) {
                    tracing::warn!(error = %e, "rtc timeout handling failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    match Receive::new(Protocol::Udp, source, local_addr, &buf[..n]) {
                        Ok(receive) => {
                            if let Err(e) = shared.handle_input(Input::Receive(Instant::now(), receive)) {
                                tracing::debug!(error = %e, "dropped inbound datagram");
                            }
                        }
                        Err(e) => tracing::trace!(error = %e, "unrecognised datagram"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "UDP receive failed"),
            },
            frame = next_frame(&mut outbound) => match frame {
                Some(frame) => {
                    if let Some(out) = outbound.as_mut() {
                        if let Err(e) = out.write(&shared, &frame) {
                            tracing::warn!(error = %e, "outbound audio dropped");
                        }
                    }
                }
                None => {
                    tracing::debug!("local track ended; outbound audio stopped");
                    outbound = None;
                }
            },
            _ = shared.wake.notified() => {}
        }
    }
    tracing::debug!("transport driver stopped");
}

/// Handle one str0m event. Returns `false` when the transport is finished.
fn dispatch(shared: &Arc<Shared>, event: Event, inbound: &mut Option<Inbound>) -> bool {
    match event {
        Event::IceConnectionStateChange(state) => {
            tracing::debug!(?state, "ICE connection state");
            if state == IceConnectionState::Disconnected {
                shared.broadcast(ChannelEvent::TransportFailed("ICE connection lost".to_string()));
                return false;
            }
        }
        Event::Connected => tracing::info!("peer transport connected"),
        Event::ChannelOpen(id, label) => {
            let channel = shared.channels.lock().get(&id).cloned();
            match channel {
                Some(channel) => {
                    tracing::debug!(%label, "data channel open");
                    channel.on_open(shared);
                }
                None => tracing::debug!(%label, "ignoring unrequested data channel"),
            }
        }
        Event::ChannelData(data) => {
            let channel = shared.channels.lock().get(&data.id).cloned();
            if let Some(channel) = channel {
                match String::from_utf8(data.data) {
                    Ok(text) => channel.emit(ChannelEvent::Message(text)),
                    Err(e) => channel.emit(ChannelEvent::Error(format!("non-UTF-8 message: {e}"))),
                }
            }
        }
        Event::ChannelClose(id) => {
            if let Some(channel) = shared.channels.lock().get(&id).cloned() {
                channel.emit(ChannelEvent::Closed);
            }
        }
        Event::MediaData(media) => {
            if inbound.is_none() {
                match OpusCodec::new(REMOTE_SAMPLE_RATE) {
                    Ok(codec) => {
                        let (tx, rx) = mpsc::channel(REMOTE_FRAME_BUFFER);
                        (shared.on_remote_track)(RemoteAudio {
                            stream_id: media.mid.to_string(),
                            frames: rx,
                        });
                        *inbound = Some(Inbound { codec, frames: tx });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote audio decoder unavailable");
                        return true;
                    }
                }
            }
            if let Some(inbound) = inbound.as_mut() {
                match inbound.codec.decode_f32(&media.data) {
                    Ok(samples) => {
                        // a full playback buffer drops the frame rather than stall the driver
                        let _ = inbound.frames.try_send(AudioFrame::new(samples, REMOTE_SAMPLE_RATE));
                    }
                    Err(e) => tracing::debug!(error = %e, "undecodable remote audio packet"),
                }
            }
        }
        _ => {}
    }
    true
}
