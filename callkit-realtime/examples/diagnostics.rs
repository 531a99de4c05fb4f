//! # Call Diagnostics Example
//!
//! Checks whether this machine can place a call: compiled-in backends,
//! microphone permission and devices, and the session token endpoint. Prints
//! the report as JSON.
//!
//! ## Running
//!
//! ```sh
//! # endpoint and backend checks only
//! cargo run -p callkit-realtime --example diagnostics
//!
//! # include real microphone enumeration
//! cargo run -p callkit-realtime --example diagnostics --features desktop-audio
//! ```

use callkit_realtime::diagnostics::probe_microphone;
use callkit_realtime::{CallConfig, HttpTokenProvider, MediaDevices, run_diagnostics};

#[cfg(feature = "desktop-audio")]
fn devices() -> Box<dyn MediaDevices> {
    Box::new(callkit_realtime::devices::CpalDevices::new())
}

#[cfg(not(feature = "desktop-audio"))]
fn devices() -> Box<dyn MediaDevices> {
    /// Stand-in when no capture backend is compiled in.
    struct NoCapture;

    #[async_trait::async_trait]
    impl MediaDevices for NoCapture {
        async fn acquire_audio(&self) -> callkit_realtime::Result<callkit_realtime::CaptureStream> {
            Err(callkit_realtime::CallError::device("no capture backend compiled in"))
        }
    }

    Box::new(NoCapture)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    callkit_telemetry::init_telemetry("callkit-diagnostics")?;

    let config = CallConfig::from_env()?;
    let provider = HttpTokenProvider::from_config(&config);
    let devices = devices();

    let report = run_diagnostics(devices.as_ref(), &provider).await;
    let microphone = probe_microphone(devices.as_ref()).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("microphone: {}", serde_json::to_string(&microphone)?);
    println!("healthy: {}", report.is_healthy());
    Ok(())
}
