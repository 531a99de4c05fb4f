//! WebRTC backend: str0m peer transport with Opus audio.

mod opus;
mod transport;

pub use opus::{OpusCodec, SUPPORTED_SAMPLE_RATES, f32_to_i16, i16_to_f32};
pub use transport::{Str0mChannel, Str0mTransport, Str0mTransportFactory};
