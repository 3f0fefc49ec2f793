//! Local audio level pipeline.
//!
//! Metering only — nothing here touches what goes on the wire. Capture
//! frames run through an optional RNNoise pass (so background noise does not
//! trip the indicator when suppression is on) and an RMS meter with a hang
//! time, publishing the local speaking flag on a watch channel.

use std::time::{Duration, Instant};

use nnnoiseless::DenoiseState;
use tokio::sync::{broadcast, watch};

use crate::engine::AudioFrame;

/// RMS level of a PCM frame in dBFS. Samples are f32 in the 16-bit integer
/// range; an empty or silent frame is negative infinity.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    if rms <= f32::EPSILON {
        f32::NEG_INFINITY
    } else {
        20.0 * (rms / 32768.0).log10()
    }
}

/// Threshold-plus-hang speaking detection.
#[derive(Debug)]
pub struct SpeakingDetector {
    threshold_dbfs: f32,
    hang: Duration,
    last_above: Option<Instant>,
}

impl SpeakingDetector {
    pub fn new(threshold_dbfs: f32, hang: Duration) -> Self {
        Self {
            threshold_dbfs,
            hang,
            last_above: None,
        }
    }

    /// Feed one frame's level; returns whether the local user counts as
    /// speaking at `now`.
    pub fn push(&mut self, level_dbfs: f32, now: Instant) -> bool {
        if level_dbfs >= self.threshold_dbfs {
            self.last_above = Some(now);
            return true;
        }
        self.last_above
            .is_some_and(|t| now.duration_since(t) <= self.hang)
    }
}

/// RNNoise wrapper that buffers arbitrary-sized frames into the model's
/// 480-sample windows and tracks the level of the newest denoised window.
pub struct NoiseSuppressor {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    last_level: f32,
    last_vad: f32,
}

impl NoiseSuppressor {
    pub const FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::with_capacity(Self::FRAME_SIZE * 2),
            last_level: f32::NEG_INFINITY,
            last_vad: 0.0,
        }
    }

    /// Feed samples; returns the level of the newest fully-denoised window
    /// (unchanged until a full window has accumulated).
    pub fn feed(&mut self, samples: &[f32]) -> f32 {
        self.pending.extend_from_slice(samples);
        let mut out = [0.0f32; Self::FRAME_SIZE];
        while self.pending.len() >= Self::FRAME_SIZE {
            let frame: Vec<f32> = self.pending.drain(..Self::FRAME_SIZE).collect();
            self.last_vad = self.state.process_frame(&mut out, &frame);
            self.last_level = rms_dbfs(&out);
        }
        self.last_level
    }

    /// RNNoise's voice probability for the newest window, 0.0..=1.0.
    pub fn voice_probability(&self) -> f32 {
        self.last_vad
    }

    /// Samples waiting for a full window.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl Default for NoiseSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LevelConfig {
    pub threshold_dbfs: f32,
    pub hang: Duration,
}

/// Spawn the metering task for one capture stream. Ends when the capture's
/// frame channel closes; the returned watch flips back to false then.
pub(crate) fn spawn_pipeline(
    mut frames: broadcast::Receiver<AudioFrame>,
    suppress: watch::Receiver<bool>,
    config: LevelConfig,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut detector = SpeakingDetector::new(config.threshold_dbfs, config.hang);
        let mut denoiser = NoiseSuppressor::new();
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let level = if *suppress.borrow() {
                        denoiser.feed(&frame.samples)
                    } else {
                        rms_dbfs(&frame.samples)
                    };
                    let speaking = detector.push(level, Instant::now());
                    tx.send_replace(speaking);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Level meter lagged; dropping frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tx.send_replace(false);
    });
    rx
}
