//! # callkit-telemetry
//!
//! Structured logging for callkit voice calls.
//!
//! ## Features
//! - Structured logging with `tracing`
//! - One-time subscriber installation driven by `RUST_LOG`
//! - Span helpers for the stages of a call (attempt, token request, handshake, side-channel)
//!
//! ## Usage
//!
//! ```rust
//! use callkit_telemetry::{init_telemetry, info, call_span};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_telemetry("voice-call")?;
//!
//!     let span = call_span("call-123", 1);
//!     let _enter = span.enter();
//!     info!("dialing");
//!     Ok(())
//! }
//! ```

pub mod init;
pub mod spans;

// Re-export tracing macros for convenience
pub use tracing::{Span, debug, error, info, instrument, trace, warn};

pub use init::{init_telemetry, init_telemetry_with_filter};
pub use spans::*;
