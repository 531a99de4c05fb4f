//! # Voice Call Example
//!
//! Places a realtime voice call from the desktop: microphone in, model audio
//! out, transcripts printed as they complete.
//!
//! ## Prerequisites
//!
//! 1. A reachable session endpoint that issues realtime client secrets.
//! 2. `cmake` installed (the `audiopus` crate builds Opus from source).
//! 3. A microphone and speakers.
//!
//! ## Environment Variables
//!
//! | Variable                 | Required | Description                           |
//! |--------------------------|----------|---------------------------------------|
//! | `CALLKIT_SESSION_URL`    | No       | Token endpoint                        |
//! | `CALLKIT_REALTIME_URL`   | No       | Provider SDP endpoint                 |
//! | `CALLKIT_REALTIME_MODEL` | No       | Realtime model id                     |
//! | `CALLKIT_DEFAULT_VOICE`  | No       | alloy, echo, fable, onyx, nova, shimmer |
//! | `CALLKIT_SYSTEM_PROMPT`  | No       | Behaviour prompt                      |
//!
//! ## Running
//!
//! ```sh
//! cargo run -p callkit-realtime --example voice_call --features full
//! ```
//!
//! Type `m` + Enter to toggle mute, `r` + Enter to retry after an error, and
//! Ctrl+C to hang up.

use callkit_realtime::devices::{CpalDevices, CpalOutput};
use callkit_realtime::webrtc::Str0mTransportFactory;
use callkit_realtime::{
    CallConfig, CallSession, ConnectionStatus, HttpTokenProvider, NegotiatorBuilder,
    SessionRequest,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    callkit_telemetry::init_telemetry("voice-call")?;

    let config = CallConfig::from_env()?;
    println!("Calling {} as voice '{}'...", config.model, config.voice);

    let negotiator = NegotiatorBuilder::from_config(&config)
        .devices(CpalDevices::new())
        .transports(Str0mTransportFactory::new())
        .output(CpalOutput::new())
        .build()?;
    let call = CallSession::new(
        negotiator,
        HttpTokenProvider::from_config(&config),
        SessionRequest::from_config(&config),
    );

    let mut state = call.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last = state.borrow().clone();

    call.start().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if current.status != last.status {
                    println!("[{}] {}", call.duration_label(), current.status);
                    if let Some(message) = current.error_message() {
                        println!("  error: {message} (type `r` to retry)");
                    }
                }
                if current.transcript != last.transcript && !current.transcript.is_empty() {
                    println!("you: {}", current.transcript);
                }
                if current.ai_response != last.ai_response && !current.ai_response.is_empty() {
                    println!("ai:  {}", current.ai_response);
                }
                last = current;
            }
            line = stdin.next_line() => match line?.as_deref().map(str::trim) {
                Some("m") => match call.toggle_mute() {
                    Some(true) => println!("muted"),
                    Some(false) => println!("unmuted"),
                    None => println!("no microphone held"),
                },
                Some("r") if call.state().status == ConnectionStatus::Error => {
                    call.retry().await;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    println!("Call ended after {}", call.duration_label());
    call.end_call();
    Ok(())
}
