//! Pre-call diagnostics: transport support, microphone, devices and the token
//! endpoint, each reported without failing the whole run.

use crate::capture::{DeviceInfo, DeviceKind, MediaDevices, PermissionStatus};
use crate::config::Voice;
use crate::token::{SessionRequest, TokenProvider};
use serde::Serialize;
use std::time::Instant;

/// Prompt used when probing the token endpoint.
pub const PROBE_PROMPT: &str = "test connection";

/// Which call backends this build can use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportSupport {
    pub supported: bool,
    /// Microphone capture backend compiled in.
    pub capture: bool,
    /// Peer transport compiled in.
    pub peer_transport: bool,
    /// Data channels ride on the peer transport.
    pub data_channel: bool,
    pub issues: Vec<String>,
}

/// Report the compiled-in backends.
pub fn transport_support() -> TransportSupport {
    let capture = cfg!(feature = "desktop-audio");
    let peer_transport = cfg!(feature = "webrtc");
    let mut issues = Vec::new();
    if !capture {
        issues.push("microphone capture not compiled in (feature `desktop-audio`)".to_string());
    }
    if !peer_transport {
        issues.push("peer transport not compiled in (feature `webrtc`)".to_string());
    }
    TransportSupport {
        supported: capture && peer_transport,
        capture,
        peer_transport,
        data_channel: peer_transport,
        issues,
    }
}

/// Outcome of a token endpoint probe. The credential itself is never kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointProbe {
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request a session and time the round trip.
pub async fn probe_session_endpoint(provider: &dyn TokenProvider) -> EndpointProbe {
    let started = Instant::now();
    let request = SessionRequest::new(PROBE_PROMPT, Voice::Alloy);
    let result = provider.create_session(&request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(credential) => EndpointProbe {
            success: true,
            latency_ms,
            session_id: credential.session_id().map(str::to_string),
            error: None,
        },
        Err(e) => EndpointProbe {
            success: false,
            latency_ms,
            session_id: None,
            error: Some(e.to_string()),
        },
    }
}

/// Outcome of a microphone probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MicrophoneProbe {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Acquire the microphone and release it straight away.
pub async fn probe_microphone(devices: &dyn MediaDevices) -> MicrophoneProbe {
    match devices.acquire_audio().await {
        Ok(stream) => {
            let device_label = stream.first_audio_track().map(|t| t.label().to_string());
            stream.stop_all();
            MicrophoneProbe { success: true, device_label, error: None }
        }
        Err(e) => MicrophoneProbe { success: false, device_label: None, error: Some(e.to_string()) },
    }
}

/// Enumerated devices split by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioDevices {
    pub microphones: Vec<DeviceInfo>,
    pub speakers: Vec<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn list_audio_devices(devices: &dyn MediaDevices) -> AudioDevices {
    match devices.list_devices().await {
        Ok(all) => {
            let (microphones, speakers) =
                all.into_iter().partition(|d| d.kind == DeviceKind::AudioInput);
            AudioDevices { microphones, speakers, error: None }
        }
        Err(e) => AudioDevices { error: Some(e.to_string()), ..Default::default() },
    }
}

pub async fn microphone_permission(devices: &dyn MediaDevices) -> PermissionStatus {
    devices.permission_status().await
}

/// Everything [`run_diagnostics`] found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub transport: TransportSupport,
    pub microphone_permission: PermissionStatus,
    pub devices: AudioDevices,
    pub session_endpoint: EndpointProbe,
}

impl DiagnosticsReport {
    /// Whether a call is expected to work.
    pub fn is_healthy(&self) -> bool {
        self.transport.supported
            && self.microphone_permission != PermissionStatus::Denied
            && self.session_endpoint.success
    }
}

/// Run every check in order, logging each result.
pub async fn run_diagnostics(
    devices: &dyn MediaDevices,
    provider: &dyn TokenProvider,
) -> DiagnosticsReport {
    let transport = transport_support();
    tracing::info!(supported = transport.supported, issues = ?transport.issues, "transport support");

    let microphone_permission = microphone_permission(devices).await;
    tracing::info!(permission = ?microphone_permission, "microphone permission");

    let devices = list_audio_devices(devices).await;
    tracing::info!(
        microphones = devices.microphones.len(),
        speakers = devices.speakers.len(),
        "audio devices"
    );

    let session_endpoint = probe_session_endpoint(provider).await;
    if session_endpoint.success {
        tracing::info!(latency_ms = session_endpoint.latency_ms, "session endpoint reachable");
    } else {
        tracing::warn!(
            latency_ms = session_endpoint.latency_ms,
            error = session_endpoint.error.as_deref().unwrap_or(""),
            "session endpoint probe failed"
        );
    }

    DiagnosticsReport { transport, microphone_permission, devices, session_endpoint }
}
