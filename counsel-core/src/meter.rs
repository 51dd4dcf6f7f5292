//! Instantaneous loudness of a capture frame.
//!
//! Drives the live activity indicator only; turn-taking is decided by the
//! remote service, so there is no hangover or smoothing state here.

use serde::{Deserialize, Serialize};

/// RMS level above which the local user is considered to be talking.
pub const DEFAULT_ACTIVITY_THRESHOLD: f32 = 0.01;

/// Multiplier mapping RMS onto the [0, 1] presentation scale.
pub const DEFAULT_VOLUME_GAIN: f32 = 5.0;

/// Root-mean-square of a sample slice. Empty input yields 0.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Strictly above the threshold; a level exactly at the threshold is inactive.
pub fn is_active(rms: f32, threshold: f32) -> bool {
    rms > threshold
}

pub fn scaled_volume(rms: f32, gain: f32) -> f32 {
    (rms * gain).min(1.0)
}

/// Meter readings for one capture frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLevel {
    pub rms: f32,
    pub active: bool,
    pub volume: f32,
}

impl FrameLevel {
    pub fn measure(samples: &[f32], threshold: f32, gain: f32) -> Self {
        let rms = rms(samples);
        Self {
            rms,
            active: is_active(rms, threshold),
            volume: scaled_volume(rms, gain),
        }
    }

    pub fn silent() -> Self {
        Self {
            rms: 0.0,
            active: false,
            volume: 0.0,
        }
    }
}
