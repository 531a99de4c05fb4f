//! The realtime voice session negotiator.
//!
//! A [`Negotiator`] owns one call's live resources (capture stream, level
//! monitor, peer transport, event side-channel) and is the only writer of the
//! published [`ConnectionState`].
//!
//! # Attempts and generations
//!
//! Every `connect` attempt and every `disconnect` advances a generation counter.
//! A `connect` continuation that resumes after its generation moved on releases
//! whatever it just acquired and stops without touching published state, so a
//! late completion after teardown is harmless.
//!
//! # Example
//!
//! ```rust,ignore
//! let negotiator = Negotiator::builder()
//!     .devices(CpalDevices::new())
//!     .transports(Str0mTransportFactory::new())
//!     .signaling(HttpSignaling::from_config(&config))
//!     .output(CpalOutput::new())
//!     .build()?;
//!
//! let credential = HttpTokenProvider::from_config(&config)
//!     .create_session(&SessionRequest::from_config(&config))
//!     .await?;
//! negotiator.connect(credential).await;
//! ```

use crate::capture::{AudioTrack, CaptureGuard, MediaDevices};
use crate::config::{CallConfig, DEFAULT_LEVEL_INTERVAL, DEFAULT_STUN_SERVER, SIDE_CHANNEL_LABEL};
use crate::error::{CallError, Result};
use crate::events::{ClientEvent, ServerEvent};
use crate::level::{AnalysisContext, LevelMonitor};
use crate::signaling::{HttpSignaling, SignalingClient};
use crate::state::{ConnectionState, ConnectionStatus, StateCell};
use crate::token::{SessionCredential, SessionRequest, TokenProvider};
use crate::transport::{
    AudioOutput, ChannelEvent, DiscardOutput, PeerTransport, RemoteAudio, RemoteTrackHandler,
    SideChannelHandle, TransportConfig, TransportFactory,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Why an attempt stopped early.
enum Abort {
    /// A newer generation owns the negotiator.
    Stale,
    Failed(CallError),
}

impl From<CallError> for Abort {
    fn from(err: CallError) -> Self {
        Self::Failed(err)
    }
}

/// Live resources of the current call, each present at most once.
#[derive(Default)]
struct Resources {
    monitor: Option<LevelMonitor>,
    channel: Option<Arc<dyn SideChannelHandle>>,
    pump: Option<CancellationToken>,
    transport: Option<Arc<dyn PeerTransport>>,
    capture: CaptureGuard,
    context: Option<Arc<AnalysisContext>>,
}

impl Resources {
    fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Release in teardown order: level loop, side-channel, transport, capture,
    /// sampling context. Returns how many resources were released.
    fn release(mut self) -> usize {
        let mut released = 0;
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
            released += 1;
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
            released += 1;
        }
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
            released += 1;
        }
        released += self.capture.release();
        if let Some(context) = self.context.take() {
            context.close();
            released += 1;
        }
        released
    }
}

struct Inner {
    call_id: String,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingClient>,
    output: Arc<dyn AudioOutput>,
    transport_config: TransportConfig,
    level_interval: Duration,
    channel_label: String,
    state: StateCell,
    resources: Mutex<Resources>,
    generation: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn ensure_current(&self, generation: u64) -> std::result::Result<(), Abort> {
        if self.is_current(generation) { Ok(()) } else { Err(Abort::Stale) }
    }

    /// Run `install` against the resources if `generation` is still current.
    /// Otherwise hand the resource to `discard` and report the attempt stale.
    fn install<T>(
        &self,
        generation: u64,
        resource: T,
        install: impl FnOnce(&mut Resources, T),
        discard: impl FnOnce(T),
    ) -> std::result::Result<(), Abort> {
        let mut resources = self.resources.lock();
        if !self.is_current(generation) {
            drop(resources);
            discard(resource);
            return Err(Abort::Stale);
        }
        install(&mut resources, resource);
        Ok(())
    }

    /// Invalidate the current generation, release everything it held and
    /// publish `Disconnected`, all under the resources lock so a concurrent
    /// `begin` never sees a half-torn-down call.
    fn disconnect(&self) {
        let mut resources = self.resources.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let released = resources.take().release();
        self.state.transition(ConnectionStatus::Disconnected);
        drop(resources);
        if released > 0 {
            tracing::debug!(call.id = %self.call_id, released, "released call resources");
        }
    }

    /// End attempt `generation` with `error`: cleanup first, then publish.
    fn fail(&self, generation: u64, error: CallError) {
        let mut resources = self.resources.lock();
        if !self.is_current(generation) {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        let released = resources.take().release();
        tracing::error!(call.id = %self.call_id, released, error = %error, "call attempt failed");
        self.state.fail(error);
    }

    /// Claim the state machine for a new attempt. `None` if one is in flight.
    fn begin(&self) -> Option<u64> {
        if self.state.status() == ConnectionStatus::Connected {
            tracing::info!(call.id = %self.call_id, "reconnecting; tearing down current call");
            self.disconnect();
        }
        let mut resources = self.resources.lock();
        if !self.state.begin_attempt() {
            tracing::warn!(
                call.id = %self.call_id,
                status = %self.state.status(),
                "connect ignored while another attempt is in flight"
            );
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // Leftovers of an earlier failed attempt are already released.
        resources.take().release();
        Some(generation)
    }

    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        credential: SessionCredential,
    ) -> std::result::Result<(), Abort> {
        // 1. capture
        let stream = self.devices.acquire_audio().await?;
        let Some(track) = stream.first_audio_track().cloned() else {
            stream.stop_all();
            return Err(CallError::device("capture stream has no audio track").into());
        };
        self.install(generation, stream, |r, s| r.capture.hold(s), |s| {
            s.stop_all();
        })?;
        tracing::debug!(track.id = %track.id(), track.label = %track.label(), "microphone acquired");

        // 2. level visualisation (cosmetic; failure only disables it)
        self.start_level_monitor(generation, &track)?;

        // 3. transport
        let output = self.output.clone();
        let on_remote_track: RemoteTrackHandler = Arc::new(move |audio: RemoteAudio| {
            let stream_id = audio.stream_id.clone();
            match output.play(audio) {
                Ok(()) => tracing::info!(stream.id = %stream_id, "playing remote audio"),
                Err(e) => tracing::warn!(stream.id = %stream_id, error = %e, "remote audio playback failed"),
            }
        });
        let transport = self.transports.create(&self.transport_config, on_remote_track).await?;
        self.install(generation, transport.clone(), |r, t| r.transport = Some(t), |t| t.close())?;

        // 4. outbound track and inbound audio line
        transport.add_track(track)?;
        transport.add_recv_only_audio()?;

        // 5. event side-channel
        let channel = transport.create_side_channel(&self.channel_label)?;
        let cancel = CancellationToken::new();
        let handle = channel.handle.clone();
        self.install(
            generation,
            (handle, cancel.clone()),
            |r, (handle, cancel)| {
                r.channel = Some(handle);
                r.pump = Some(cancel);
            },
            |(handle, _)| handle.close(),
        )?;
        let span = callkit_telemetry::side_channel_span(&self.channel_label);
        tokio::spawn(
            pump(Arc::downgrade(self), generation, channel.events, cancel).instrument(span),
        );

        // 6. local offer
        let offer = transport.create_offer().await?;
        self.ensure_current(generation)?;
        transport.set_local_description(offer.clone()).await?;
        self.ensure_current(generation)?;

        // 7. signaling
        let answer = self.signaling.exchange(&credential, &offer).await?;
        drop(credential);
        self.ensure_current(generation)?;

        // 8. remote answer
        transport.set_remote_description(answer).await?;
        self.ensure_current(generation)?;

        Ok(())
    }

    fn start_level_monitor(&self, generation: u64, track: &AudioTrack) -> std::result::Result<(), Abort> {
        let context = match AnalysisContext::new(track) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(error = %e, "audio level visualisation disabled");
                return Ok(());
            }
        };

        let state = self.state.clone();
        let monitor = LevelMonitor::start(context.clone(), self.level_interval, move |level| {
            state.update(|s| {
                if !s.status.is_active() || s.audio_level == level {
                    return false;
                }
                s.audio_level = level;
                true
            });
        });

        self.install(
            generation,
            (monitor, context),
            |r, (monitor, context)| {
                r.monitor = Some(monitor);
                r.context = Some(context);
            },
            |(monitor, context)| {
                monitor.stop();
                context.close();
            },
        )
    }

    /// Run an attempt that has already been claimed by [`Inner::begin`].
    async fn run(self: &Arc<Self>, generation: u64, credential: SessionCredential) -> ConnectionStatus {
        match self.establish(generation, credential).await {
            Ok(()) => {
                tracing::info!(call.id = %self.call_id, "handshake complete");
            }
            Err(Abort::Stale) => {
                tracing::debug!(call.id = %self.call_id, "stale connect completion ignored");
            }
            Err(Abort::Failed(error)) => self.fail(generation, error),
        }
        self.state.status()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let released = self.resources.get_mut().take().release();
        if released > 0 {
            tracing::debug!(call.id = %self.call_id, released, "negotiator dropped; call resources released");
        }
    }
}

/// Process side-channel events one at a time, in arrival order.
async fn pump(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else { break };
        if !inner.is_current(generation) {
            break;
        }

        match event {
            ChannelEvent::Open => {
                tracing::info!(call.id = %inner.call_id, "side channel open");
                inner.state.transition(ConnectionStatus::Connected);
            }
            ChannelEvent::Message(text) => match ServerEvent::parse(&text) {
                Ok(event) => inner.state.update(|s| event.apply(s)),
                Err(e) => tracing::warn!(error = %e, "dropping malformed side-channel message"),
            },
            ChannelEvent::Error(message) => {
                tracing::warn!(error = %message, "side channel error");
                inner.state.update(|s| {
                    s.error = Some(CallError::SideChannel(message));
                    true
                });
            }
            ChannelEvent::Closed => {
                tracing::debug!("side channel closed");
            }
            ChannelEvent::TransportFailed(reason) => {
                inner.fail(generation, CallError::transport(reason));
                break;
            }
        }
    }
}

/// Handle to a call's negotiator. Clones share the same call.
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("call_id", &self.inner.call_id)
            .field("status", &self.inner.state.status())
            .finish()
    }
}

impl Negotiator {
    /// Create a new builder.
    pub fn builder() -> NegotiatorBuilder {
        NegotiatorBuilder::new()
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    /// Current published state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.snapshot()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.status()
    }

    /// Watch published state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Run the connect sequence with `credential`.
    ///
    /// Never fails: the outcome is published through [`Negotiator::state`] and
    /// the status at the time the sequence settles is returned. `Connected` is
    /// reached once the side-channel opens, which may be after this returns.
    pub async fn connect(&self, credential: SessionCredential) -> ConnectionStatus {
        let Some(generation) = self.inner.begin() else {
            return self.status();
        };
        let span = callkit_telemetry::call_span(&self.inner.call_id, generation);
        self.inner.run(generation, credential).instrument(span).await
    }

    /// Fetch a fresh credential from `provider`, then connect with it. Token
    /// failures surface as `Connecting -> Error`.
    pub async fn connect_with(
        &self,
        provider: &dyn TokenProvider,
        request: &SessionRequest,
    ) -> ConnectionStatus {
        let Some(generation) = self.inner.begin() else {
            return self.status();
        };
        let span = callkit_telemetry::call_span(&self.inner.call_id, generation);
        async {
            match provider.create_session(request).await {
                Ok(credential) if self.inner.is_current(generation) => {
                    self.inner.run(generation, credential).await
                }
                Ok(_) => self.status(),
                Err(error) => {
                    self.inner.fail(generation, error);
                    self.status()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Tear everything down and publish `Disconnected`. Safe in any state and
    /// any number of times.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Flip the local track's enabled flag. Returns the new mute state, or
    /// `None` when no capture stream is held.
    pub fn toggle_mute(&self) -> Option<bool> {
        let muted = self.inner.resources.lock().capture.toggle_mute()?;
        self.publish_mute(muted);
        Some(muted)
    }

    /// Set the local track's mute state. `None` when no capture stream is held.
    pub fn set_muted(&self, muted: bool) -> Option<bool> {
        let muted = self.inner.resources.lock().capture.set_muted(muted)?;
        self.publish_mute(muted);
        Some(muted)
    }

    fn publish_mute(&self, muted: bool) {
        self.inner.state.update(|s| {
            let changed = s.is_muted != muted;
            s.is_muted = muted;
            changed
        });
    }

    /// Send an event to the remote endpoint over the side-channel.
    pub fn send_event(&self, event: &ClientEvent) -> Result<()> {
        let channel = self.inner.resources.lock().channel.clone().ok_or(CallError::NotConnected)?;
        channel.send_text(event.to_json()?)
    }
}

/// Builder for [`Negotiator`].
pub struct NegotiatorBuilder {
    devices: Option<Arc<dyn MediaDevices>>,
    transports: Option<Arc<dyn TransportFactory>>,
    signaling: Option<Arc<dyn SignalingClient>>,
    output: Option<Arc<dyn AudioOutput>>,
    ice_servers: Vec<String>,
    level_interval: Duration,
    channel_label: String,
}

impl Default for NegotiatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiatorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            devices: None,
            transports: None,
            signaling: None,
            output: None,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            level_interval: DEFAULT_LEVEL_INTERVAL,
            channel_label: SIDE_CHANNEL_LABEL.to_string(),
        }
    }

    /// Take ICE servers and sampling cadence from `config`, and signal over HTTP
    /// to its realtime endpoint.
    pub fn from_config(config: &CallConfig) -> Self {
        Self::new()
            .ice_servers(config.ice_servers.clone())
            .level_interval(config.level_interval)
            .signaling(HttpSignaling::from_config(config))
    }

    /// Set the capture source.
    pub fn devices(mut self, devices: impl MediaDevices + 'static) -> Self {
        self.devices = Some(Arc::new(devices));
        self
    }

    /// Set the transport factory.
    pub fn transports(mut self, transports: impl TransportFactory + 'static) -> Self {
        self.transports = Some(Arc::new(transports));
        self
    }

    /// Set the signaling client.
    pub fn signaling(mut self, signaling: impl SignalingClient + 'static) -> Self {
        self.signaling = Some(Arc::new(signaling));
        self
    }

    /// Set remote audio playback. Defaults to [`DiscardOutput`].
    pub fn output(mut self, output: impl AudioOutput + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }

    /// Replace the ICE server list.
    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the level sampling interval.
    pub fn level_interval(mut self, interval: Duration) -> Self {
        self.level_interval = interval;
        self
    }

    /// Set the side-channel label.
    pub fn channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }

    /// Build the negotiator (does not connect yet).
    pub fn build(self) -> Result<Negotiator> {
        let devices = self.devices.ok_or_else(|| CallError::config("Media devices are required"))?;
        let transports =
            self.transports.ok_or_else(|| CallError::config("Transport factory is required"))?;
        let signaling =
            self.signaling.ok_or_else(|| CallError::config("Signaling client is required"))?;
        if self.ice_servers.is_empty() {
            return Err(CallError::config("At least one ICE server is required"));
        }
        if self.level_interval.is_zero() {
            return Err(CallError::config("Level interval must be positive"));
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(call.id = %call_id, "negotiator created");

        Ok(Negotiator {
            inner: Arc::new(Inner {
                call_id,
                devices,
                transports,
                signaling,
                output: self.output.unwrap_or_else(|| Arc::new(DiscardOutput)),
                transport_config: TransportConfig::new(self.ice_servers),
                level_interval: self.level_interval,
                channel_label: self.channel_label,
                state: StateCell::new(),
                resources: Mutex::new(Resources::default()),
                generation: AtomicU64::new(0),
            }),
        })
    }
}
