//! Data model shared by every pipeline stage.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::audio::{self, AudioFrame};

/// One sentence-like span of text, synthesized as an atomic piece of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisUnit {
    pub index: usize,
    pub text: String,
}

/// Voice selection: a language key plus an optional named voice.
///
/// Parsed from `"en_US"` (language default) or `"en_US/lessac"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceRef {
    pub language: String,
    pub voice: Option<String>,
}

impl VoiceRef {
    pub fn language(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            voice: None,
        }
    }

    pub fn named(language: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            voice: Some(voice.into()),
        }
    }
}

impl fmt::Display for VoiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.voice {
            Some(v) => write!(f, "{}/{}", self.language, v),
            None => f.write_str(&self.language),
        }
    }
}

impl FromStr for VoiceRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lang, voice) = match s.split_once('/') {
            Some((l, v)) => (l, Some(v)),
            None => (s, None),
        };
        if !is_valid_language_code(lang) {
            return Err(anyhow::anyhow!(
                "Invalid language code format: {lang}. Expected format: ll_CC (e.g., en_US, de_DE)"
            ));
        }
        if let Some(v) = voice {
            let ok = !v.is_empty()
                && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !ok {
                return Err(anyhow::anyhow!("Invalid voice id: '{v}'"));
            }
        }
        Ok(Self {
            language: lang.to_string(),
            voice: voice.map(str::to_string),
        })
    }
}

/// Language code in the form `ll` or `ll_CC`.
pub fn is_valid_language_code(code: &str) -> bool {
    let parts: Vec<&str> = code.split('_').collect();
    let lower = |p: &str| p.len() == 2 && p.chars().all(|c| c.is_ascii_lowercase());
    match parts.as_slice() {
        [l] => lower(l),
        [l, c] => lower(l) && c.len() == 2 && c.chars().all(|ch| ch.is_ascii_uppercase()),
        _ => false,
    }
}

/// Parameters that stay constant for a whole stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    pub voice: VoiceRef,
    pub speed: f32,
    pub normalize: bool,
}

/// Everything needed to reproduce one backend call.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub unit: SynthesisUnit,
    pub voice: VoiceRef,
    pub speed: f32,
    pub normalize: bool,
}

impl SynthesisRequest {
    pub fn new(unit: SynthesisUnit, params: &SynthesisParams) -> Self {
        Self {
            unit,
            voice: params.voice.clone(),
            speed: params.speed,
            normalize: params.normalize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Ok,
    Failed(String),
}

/// Exactly one of these exists per dispatched unit, even on failure.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub index: usize,
    pub text: String,
    pub frames: Vec<AudioFrame>,
    pub outcome: UnitOutcome,
    pub elapsed: Duration,
    pub cached: bool,
}

impl SynthesisResult {
    pub fn ok(unit: SynthesisUnit, frames: Vec<AudioFrame>, elapsed: Duration) -> Self {
        Self {
            index: unit.index,
            text: unit.text,
            frames,
            outcome: UnitOutcome::Ok,
            elapsed,
            cached: false,
        }
    }

    /// A failed unit carries no audio, only the reason.
    pub fn failed(unit: SynthesisUnit, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            index: unit.index,
            text: unit.text,
            frames: Vec::new(),
            outcome: UnitOutcome::Failed(reason.into()),
            elapsed,
            cached: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == UnitOutcome::Ok
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            UnitOutcome::Failed(reason) => Some(reason),
            UnitOutcome::Ok => None,
        }
    }

    /// Concatenated samples and their sample rate.
    pub fn samples(&self) -> (Vec<f32>, u32) {
        let rate = self.frames.first().map(|f| f.sample_rate).unwrap_or(0);
        (audio::concat(&self.frames), rate)
    }
}
