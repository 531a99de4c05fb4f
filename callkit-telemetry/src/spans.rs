//! Span helpers for the stages of a voice call
//!
//! Provides pre-configured spans so every crate records the same field names.

use tracing::Span;

/// Create a span for one connect attempt of a call.
///
/// # Arguments
/// * `call_id` - Identifier of the negotiator instance
/// * `generation` - Attempt number; increases on every connect/disconnect
///
/// # Example
/// ```
/// use callkit_telemetry::call_span;
/// let span = call_span("call-123", 2);
/// let _enter = span.enter();
/// ```
pub fn call_span(call_id: &str, generation: u64) -> Span {
    tracing::info_span!("call.connect", call.id = call_id, call.generation = generation)
}

/// Create a span for the session token request.
pub fn token_request_span(endpoint: &str) -> Span {
    tracing::info_span!("call.token_request", http.url = endpoint, otel.kind = "client")
}

/// Create a span for the SDP offer/answer exchange.
///
/// # Example
/// ```
/// use callkit_telemetry::handshake_span;
/// let span = handshake_span("gpt-4o-realtime-preview-2024-12-17");
/// let _enter = span.enter();
/// ```
pub fn handshake_span(model: &str) -> Span {
    tracing::info_span!("call.handshake", model.name = model, otel.kind = "client")
}

/// Create a span for the event side-channel pump.
pub fn side_channel_span(label: &str) -> Span {
    tracing::debug_span!("call.side_channel", channel.label = label)
}
