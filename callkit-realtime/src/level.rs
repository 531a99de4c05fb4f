//! Input level visualisation.
//!
//! [`FrequencyAnalyser`] turns the most recent window of captured audio into
//! byte frequency data (the same scale a browser analyser node reports), and the
//! level is the mean of those bytes normalised to `[0, 1]`.
//!
//! [`LevelMonitor`] samples an [`AnalysisContext`] once per display frame until it
//! is cancelled. Muting does not stop it; a muted track simply reads as silence.

use crate::capture::{AudioFrame, AudioTrack};
use crate::error::{CallError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Analysis window length in samples.
pub const FFT_SIZE: usize = 256;

/// Weight of the previous spectrum when smoothing over time.
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Magnitude (dB) mapped to byte 0.
pub const MIN_DECIBELS: f32 = -100.0;

/// Magnitude (dB) mapped to byte 255.
pub const MAX_DECIBELS: f32 = -30.0;

/// Largest value in byte frequency data.
pub const MAX_BYTE_MAGNITUDE: f32 = 255.0;

/// Windowed spectrum analyser over the last [`FFT_SIZE`] samples.
pub struct FrequencyAnalyser {
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    samples: VecDeque<f32>,
    smoothed: Vec<f32>,
}

impl Default for FrequencyAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyAnalyser {
    pub fn new() -> Self {
        let n = FFT_SIZE as f32;
        // Blackman window
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).cos()).collect();
        let sin_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).sin()).collect();

        Self {
            window,
            cos_table,
            sin_table,
            samples: VecDeque::from(vec![0.0; FFT_SIZE]),
            smoothed: vec![0.0; FFT_SIZE / 2],
        }
    }

    /// Number of frequency bins.
    pub fn frequency_bin_count(&self) -> usize {
        FFT_SIZE / 2
    }

    /// Append samples, keeping only the newest window.
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(FFT_SIZE);
        for &s in &samples[skip..] {
            if self.samples.len() == FFT_SIZE {
                self.samples.pop_front();
            }
            self.samples.push_back(s);
        }
    }

    /// Fill `out` with byte frequency data for the current window.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let bins = self.frequency_bin_count();
        let scale = MAX_BYTE_MAGNITUDE / (MAX_DECIBELS - MIN_DECIBELS);

        for k in 0..bins {
            let mut re = 0.0f32;
            let mut im = 0.0f32;
            for (n, &x) in self.samples.iter().enumerate() {
                let v = x * self.window[n];
                let idx = (k * n) % FFT_SIZE;
                re += v * self.cos_table[idx];
                im -= v * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f32;
            let smoothed = SMOOTHING_TIME_CONSTANT * self.smoothed[k]
                + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            self.smoothed[k] = if smoothed.is_finite() { smoothed } else { 0.0 };

            if let Some(slot) = out.get_mut(k) {
                let db = 20.0 * self.smoothed[k].log10();
                let byte = if db.is_finite() { scale * (db - MIN_DECIBELS) } else { 0.0 };
                *slot = byte.clamp(0.0, MAX_BYTE_MAGNITUDE) as u8;
            }
        }
    }

    /// Mean magnitude of the spectrum normalised to `[0, 1]`.
    pub fn level(&mut self) -> f32 {
        let mut data = vec![0u8; self.frequency_bin_count()];
        self.byte_frequency_data(&mut data);
        normalized_level(&data)
    }
}

/// Arithmetic mean of byte magnitudes divided by the maximum byte value.
pub fn normalized_level(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
    (sum as f32 / data.len() as f32 / MAX_BYTE_MAGNITUDE).clamp(0.0, 1.0)
}

/// The sampling context: an analyser fed from one capture track.
pub struct AnalysisContext {
    analyser: Mutex<FrequencyAnalyser>,
    frames: Mutex<Option<broadcast::Receiver<AudioFrame>>>,
    closed: AtomicBool,
}

impl AnalysisContext {
    /// Attach to `track`. Fails if the track is already stopped.
    pub fn new(track: &AudioTrack) -> Result<Arc<Self>> {
        let frames = track
            .subscribe()
            .ok_or_else(|| CallError::audio("capture track stopped before analysis started"))?;
        Ok(Arc::new(Self {
            analyser: Mutex::new(FrequencyAnalyser::new()),
            frames: Mutex::new(Some(frames)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Feed everything captured since the last call and return the current level.
    /// `None` once the context is closed or its track stopped.
    pub fn sample(&self) -> Option<f32> {
        if self.is_closed() {
            return None;
        }
        let mut frames = self.frames.lock();
        let rx = frames.as_mut()?;
        let mut analyser = self.analyser.lock();
        loop {
            match rx.try_recv() {
                Ok(frame) => analyser.push(&frame.samples),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::trace!(skipped, "level analyser lagged behind capture");
                }
                Err(TryRecvError::Closed) => {
                    frames.take();
                    return None;
                }
            }
        }
        Some(analyser.level())
    }

    /// Detach from the track. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.frames.lock().take();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Repeating sampling task, stopped only through [`LevelMonitor::stop`].
pub struct LevelMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LevelMonitor {
    /// Spawn the sampling loop. `publish` receives every sampled level.
    pub fn start<F>(context: Arc<AnalysisContext>, interval: Duration, publish: F) -> Self
    where
        F: Fn(f32) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match context.sample() {
                        Some(level) => publish(level),
                        None => break,
                    },
                }
            }
            tracing::debug!("level monitor stopped");
        });

        Self { cancel, handle }
    }

    /// Cancel the loop. Returns `true` for the call that cancelled it.
    pub fn stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for LevelMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
