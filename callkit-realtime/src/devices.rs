//! Desktop audio through cpal: microphone capture and remote playback.
//!
//! cpal streams are `!Send` on some platforms, so each one lives on its own
//! thread for as long as it is needed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::capture::{AudioTrack, CaptureStream, DeviceInfo, DeviceKind, MediaDevices};
use crate::error::{CallError, Result};
use crate::transport::{AudioOutput, RemoteAudio};

/// Rate of captured tracks; one the Opus encoder accepts.
pub const CAPTURE_SAMPLE_RATE: u32 = 48_000;

/// Playback queue bound (two seconds at 48 kHz); older audio is dropped first.
const MAX_PLAYBACK_QUEUE: usize = 96_000;

/// Map a backend message to the capture error taxonomy.
fn classify_device_error(message: String) -> CallError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CallError::permission(message)
    } else {
        CallError::device(message)
    }
}

/// Streaming linear resampler.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self { step: from_rate as f64 / to_rate.max(1) as f64, pos: 0.0, prev: 0.0 }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Resample `input`, appending to `out`. State carries across calls.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(&last) = input.last() else {
            return;
        };
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        let len = input.len() as f64;
        // index 0 is the last sample of the previous call
        while self.pos < len {
            let i = self.pos as usize;
            let frac = (self.pos - i as f64) as f32;
            let a = if i == 0 { self.prev } else { input[i - 1] };
            let b = input[i];
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        self.pos -= len;
        self.prev = last;
    }
}

/// Microphone capture from the default input device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn open_input(track_tx: oneshot::Sender<Result<Arc<AudioTrack>>>) {
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let opened = (|| -> Result<(Arc<AudioTrack>, cpal::Stream)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| CallError::device("no input device available"))?;
        let name = device.name().unwrap_or_else(|_| "default input".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| classify_device_error(e.to_string()))?;

        let track = AudioTrack::new(name, CAPTURE_SAMPLE_RATE);
        let config: cpal::StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_capture::<f32>(&device, &config, track.clone()),
            cpal::SampleFormat::I16 => build_capture::<i16>(&device, &config, track.clone()),
            cpal::SampleFormat::U16 => build_capture::<u16>(&device, &config, track.clone()),
            other => Err(CallError::device(format!("unsupported input sample format {other}"))),
        }?;
        stream.play().map_err(|e| classify_device_error(e.to_string()))?;

        tracing::info!(
            device = %track.label(),
            device.rate = config.sample_rate.0,
            device.channels = config.channels,
            "microphone capture started"
        );
        Ok((track, stream))
    })();

    match opened {
        Ok((track, stream)) => {
            track.on_stop(move || {
                let _ = stop_tx.send(());
            });
            if track_tx.send(Ok(track.clone())).is_err() {
                // caller went away before the stream was handed over
                track.stop();
            }
            // returns once the track stops
            let _ = stop_rx.recv();
            drop(stream);
            tracing::debug!("microphone capture stopped");
        }
        Err(e) => {
            let _ = track_tx.send(Err(e));
        }
    }
}

fn build_capture<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<AudioTrack>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut resampler = LinearResampler::new(config.sample_rate.0, CAPTURE_SAMPLE_RATE);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                track.push(&resampled);
            },
            |err| tracing::warn!(error = %err, "capture stream error"),
            None,
        )
        .map_err(|e| classify_device_error(e.to_string()))
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire_audio(&self) -> Result<CaptureStream> {
        let (track_tx, track_rx) = oneshot::channel();
        thread::Builder::new()
            .name("callkit-capture".to_string())
            .spawn(move || open_input(track_tx))
            .map_err(|e| CallError::device(format!("failed to start capture thread: {e}")))?;

        let track = track_rx
            .await
            .map_err(|_| CallError::device("capture thread exited before opening the device"))??;
        Ok(CaptureStream::new(vec![track]))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        tokio::task::spawn_blocking(|| {
            let host = cpal::default_host();
            let mut devices = Vec::new();
            let inputs = host.input_devices().map_err(|e| CallError::device(e.to_string()))?;
            for (index, device) in inputs.enumerate() {
                let label = device.name().unwrap_or_default();
                devices.push(DeviceInfo {
                    id: format!("input-{index}"),
                    label,
                    kind: DeviceKind::AudioInput,
                });
            }
            let outputs = host.output_devices().map_err(|e| CallError::device(e.to_string()))?;
            for (index, device) in outputs.enumerate() {
                let label = device.name().unwrap_or_default();
                devices.push(DeviceInfo {
                    id: format!("output-{index}"),
                    label,
                    kind: DeviceKind::AudioOutput,
                });
            }
            Ok(devices)
        })
        .await?
    }
}

/// Remote audio playback on the default output device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

fn build_playback<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = T::from_sample(queue.pop_front().unwrap_or(0.0));
                    frame.fill(sample);
                }
            },
            |err| tracing::warn!(error = %err, "playback stream error"),
            None,
        )
        .map_err(|e| CallError::device(e.to_string()))
}

fn play_remote(mut audio: RemoteAudio) -> Result<()> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| CallError::device("no output device available"))?;
    let supported = device.default_output_config().map_err(|e| CallError::device(e.to_string()))?;
    let config: cpal::StreamConfig = supported.config();
    let queue = Arc::new(Mutex::new(VecDeque::new()));

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_playback::<f32>(&device, &config, queue.clone()),
        cpal::SampleFormat::I16 => build_playback::<i16>(&device, &config, queue.clone()),
        cpal::SampleFormat::U16 => build_playback::<u16>(&device, &config, queue.clone()),
        other => Err(CallError::device(format!("unsupported output sample format {other}"))),
    }?;
    stream.play().map_err(|e| CallError::device(e.to_string()))?;
    tracing::info!(stream.id = %audio.stream_id, device.rate = config.sample_rate.0, "remote playback started");

    let mut resampler: Option<(u32, LinearResampler)> = None;
    let mut resampled = Vec::new();
    while let Some(frame) = audio.frames.blocking_recv() {
        let resampler = match &mut resampler {
            Some((rate, r)) if *rate == frame.sample_rate => r,
            slot => &mut slot
                .insert((frame.sample_rate, LinearResampler::new(frame.sample_rate, config.sample_rate.0)))
                .1,
        };
        resampled.clear();
        resampler.process(&frame.samples, &mut resampled);

        let mut queue = queue.lock();
        queue.extend(resampled.iter().copied());
        let excess = queue.len().saturating_sub(MAX_PLAYBACK_QUEUE);
        queue.drain(..excess);
    }

    drop(stream);
    tracing::debug!(stream.id = %audio.stream_id, "remote playback finished");
    Ok(())
}

impl AudioOutput for CpalOutput {
    fn play(&self, audio: RemoteAudio) -> Result<()> {
        thread::Builder::new()
            .name("callkit-playback".to_string())
            .spawn(move || {
                if let Err(e) = play_remote(audio) {
                    tracing::warn!(error = %e, "remote playback failed");
                }
            })
            .map_err(|e| CallError::device(format!("failed to start playback thread: {e}")))?;
        Ok(())
    }
}
