//! Non-streaming handlers: health, voices, metrics and one-shot synthesis.

use std::{sync::atomic::Ordering, time::Instant};

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::info;
use tts_core::{audio, encode_wav, encode_wav_base64, VoiceDetail};

use crate::{
    error::ApiError,
    metrics::{system_metrics, CacheStatsResponse, MetricsResponse, OneShotStats},
    validation::{EmptyText, SpeakRequest},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct TtsResponse {
    pub audio_base64: String,
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub sentences: usize,
}

/// `ok` once at least one voice is loaded; 503 otherwise.
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    if state.pipeline.backend().languages().is_empty() {
        return Err(ApiError::Unavailable("No voices loaded".to_string()));
    }
    Ok("ok")
}

pub async fn list_voices(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.pipeline.backend().languages())
}

pub async fn list_voices_detail(State(state): State<AppState>) -> Json<Vec<VoiceDetail>> {
    Json(state.pipeline.backend().voice_details())
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let request_count = state.request_count.load(Ordering::Relaxed);
    let cache = state.pipeline.cache_stats();
    let lookups = cache.hits + cache.misses;
    let hit_rate = if lookups == 0 {
        0.0
    } else {
        cache.hits as f64 / lookups as f64 * 100.0
    };

    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: system_metrics(request_count, state.started_at.elapsed()),
        streams: state.metrics.streams.snapshot(),
        one_shot: OneShotStats {
            errors: state.metrics.one_shot_errors.load(Ordering::Relaxed),
            latency: state.metrics.one_shot.snapshot(),
        },
        cache: CacheStatsResponse {
            hits: cache.hits,
            misses: cache.misses,
            hit_rate,
        },
        active_backend_calls: state.pipeline.active_backend_calls(),
    })
}

/// Run the whole text through the pipeline and join the units into one clip.
async fn synthesize_clip(state: &AppState, req: SpeakRequest) -> Result<(Vec<f32>, u32, usize), ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let params = state.resolve_params(&req, EmptyText::Reject)?;
    let started = Instant::now();

    let result = state.pipeline.synthesize_all(&req.text, params).await;
    state.metrics.one_shot.record(started.elapsed());
    let (samples, sample_rate, report) = result.map_err(|e| {
        state.metrics.one_shot_errors.fetch_add(1, Ordering::Relaxed);
        ApiError::TtsError(e)
    })?;

    info!(
        sentences = report.total_units,
        samples = samples.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "one-shot synthesis done"
    );
    Ok((samples, sample_rate, report.total_units))
}

pub async fn tts_endpoint(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<Json<TtsResponse>, ApiError> {
    let (samples, sample_rate, sentences) = synthesize_clip(&state, req).await?;
    let audio_base64 = encode_wav_base64(&samples, sample_rate)
        .map_err(|e| ApiError::TtsError(anyhow::anyhow!("WAV encoding error: {e}")))?;

    Ok(Json(TtsResponse {
        audio_base64,
        duration_ms: audio::duration_ms(samples.len(), sample_rate),
        sample_rate,
        sentences,
    }))
}

/// Same as `/tts` but answers with the WAV bytes directly.
pub async fn synthesize_wav(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (samples, sample_rate, _) = synthesize_clip(&state, req).await?;
    let wav = encode_wav(&samples, sample_rate)
        .map_err(|e| ApiError::TtsError(anyhow::anyhow!("WAV encoding error: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], wav))
}
