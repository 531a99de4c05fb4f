//! Opus codec for the audio media line.

use std::convert::TryFrom;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};

use crate::error::{CallError, Result};

/// Upper bound for one encoded Opus frame.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// Samples per channel in the longest Opus frame (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 5760;

/// Sample rates Opus accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Mono Opus encoder/decoder pair tuned for speech.
///
/// ```rust,ignore
/// let mut codec = OpusCodec::new(48_000)?;
/// let packet = codec.encode_f32(&[0.0; 960])?; // 20 ms
/// let pcm = codec.decode_f32(&packet)?;
/// ```
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
    sample_rate: u32,
}

impl OpusCodec {
    /// Create a mono codec at `sample_rate` (one of [`SUPPORTED_SAMPLE_RATES`]).
    pub fn new(sample_rate: u32) -> Result<Self> {
        let rate = SampleRate::try_from(sample_rate as i32)
            .map_err(|e| CallError::audio(format!("unsupported Opus sample rate {sample_rate}: {e}")))?;

        let encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| CallError::audio(format!("failed to create Opus encoder: {e}")))?;
        let decoder = Decoder::new(rate, Channels::Mono)
            .map_err(|e| CallError::audio(format!("failed to create Opus decoder: {e}")))?;

        Ok(Self { encoder, decoder, sample_rate })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples in one 20 ms frame.
    pub fn frame_samples(&self) -> usize {
        self.sample_rate as usize / 50
    }

    /// Encode one frame of PCM16. The length must be a valid Opus frame size
    /// (2.5, 5, 10, 20, 40 or 60 ms).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| CallError::audio(format!("Opus encode failed: {e}")))?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode one packet to PCM16.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut output = vec![0i16; MAX_DECODED_SAMPLES_PER_CHANNEL];

        let packet = audiopus::packet::Packet::try_from(packet)
            .map_err(|e| CallError::audio(format!("invalid Opus packet: {e}")))?;
        let signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|e| CallError::audio(format!("failed to create output buffer: {e}")))?;

        let decoded = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| CallError::audio(format!("Opus decode failed: {e}")))?;
        output.truncate(decoded);
        Ok(output)
    }

    pub fn encode_f32(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        self.encode(&f32_to_i16(samples))
    }

    pub fn decode_f32(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        Ok(i16_to_f32(&self.decode(packet)?))
    }
}

/// Convert `[-1.0, 1.0]` floats to PCM16, clamping out-of-range input.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).collect()
}

/// Convert PCM16 to `[-1.0, 1.0]` floats.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect()
}
