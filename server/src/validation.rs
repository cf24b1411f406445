use serde::Deserialize;
use tts_core::{SynthesisParams, VoiceRef};

use crate::error::ApiError;

/// Upper bound for the `speed` multiplier.
const MAX_SPEED: f32 = 4.0;

/// Inbound body for every synthesis endpoint, streaming or not.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub normalize: Option<bool>,
}

/// Whether whitespace-only text is acceptable. Streams accept it and finish
/// with zero chunks; one-shot synthesis has nothing to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyText {
    Allow,
    Reject,
}

/// Check the request shape and resolve defaults. Voice availability is
/// checked separately against the backend.
pub fn validate_speak_request(
    req: &SpeakRequest,
    max_text_length: usize,
    default_language: Option<&str>,
    empty: EmptyText,
) -> Result<SynthesisParams, ApiError> {
    if empty == EmptyText::Reject && req.text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if req.text.len() > max_text_length {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {max_text_length} bytes)"
        )));
    }

    let speed = req.speed.unwrap_or(1.0);
    if !speed.is_finite() || speed <= 0.0 || speed > MAX_SPEED {
        return Err(ApiError::InvalidInput(format!(
            "Speed must be greater than 0 and at most {MAX_SPEED}"
        )));
    }

    let voice = match req.voice.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse::<VoiceRef>()
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?,
        None => match default_language {
            Some(lang) => VoiceRef::language(lang),
            None => return Err(ApiError::Unavailable("No voices loaded".to_string())),
        },
    };

    Ok(SynthesisParams {
        voice,
        speed,
        normalize: req.normalize.unwrap_or(false),
    })
}
