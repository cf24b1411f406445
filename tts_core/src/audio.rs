//! Audio buffers produced by the synthesis backend, plus the few sample-level
//! transforms the pipeline applies before encoding.

use serde::Serialize;

/// Raw mono samples in `[-1.0, 1.0]` with their sample rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }
}

pub fn duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (sample_count as f64 / sample_rate as f64 * 1000.0) as u64
}

/// Convert a dBFS level into a linear amplitude (-3 dBFS ~= 0.708).
pub fn dbfs_to_amplitude(dbfs: f32) -> f32 {
    10f32.powf(dbfs / 20.0)
}

/// Largest absolute sample value across all frames.
pub fn peak(frames: &[AudioFrame]) -> f32 {
    frames
        .iter()
        .flat_map(|f| f.samples.iter())
        .fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Scale every frame by one gain so the overall peak reaches `target_dbfs`.
///
/// Returns the applied gain, or `None` when the frames are silent and were
/// left untouched.
pub fn normalize_peak(frames: &mut [AudioFrame], target_dbfs: f32) -> Option<f32> {
    let peak = peak(frames);
    if peak <= f32::EPSILON || !peak.is_finite() {
        return None;
    }
    let gain = dbfs_to_amplitude(target_dbfs) / peak;
    for frame in frames.iter_mut() {
        for s in frame.samples.iter_mut() {
            *s *= gain;
        }
    }
    Some(gain)
}

/// Sample rate shared by every frame, or `None` when they disagree.
pub fn common_sample_rate(frames: &[AudioFrame]) -> Option<u32> {
    let first = frames.first()?.sample_rate;
    frames
        .iter()
        .all(|f| f.sample_rate == first)
        .then_some(first)
}

/// Concatenate frames into one buffer. Callers check the sample rates first.
pub fn concat(frames: &[AudioFrame]) -> Vec<f32> {
    let total = frames.iter().map(|f| f.samples.len()).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.extend_from_slice(&frame.samples);
    }
    out
}

/// Change playback speed by linear interpolation. `speed > 1.0` shortens the
/// audio. Pitch shifts along with tempo.
pub fn time_scale(samples: &[f32], speed: f32) -> Vec<f32> {
    if samples.is_empty() || !speed.is_finite() || speed <= 0.0 || (speed - 1.0).abs() < 1e-3 {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as f64) / speed as f64).round().max(1.0) as usize;
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * speed as f64;
        let idx = pos.floor() as usize;
        if idx >= last {
            out.push(samples[last]);
            continue;
        }
        let frac = (pos - idx as f64) as f32;
        out.push(samples[idx] * (1.0 - frac) + samples[idx + 1] * frac);
    }
    out
}

/// Silence inserted after a unit when units are joined into one clip,
/// based on how the unit's text ends.
pub fn pause_after_ms(text: &str) -> u32 {
    let trimmed = text.trim_end();
    if trimmed.ends_with(['.', '!', '?']) {
        400
    } else if trimmed.ends_with([';', ':']) {
        250
    } else if trimmed.ends_with(',') {
        150
    } else {
        100
    }
}
