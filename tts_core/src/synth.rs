//! The backend seam and the per-unit adapter around it.
//!
//! [`UnitSynthesizer`] is the isolation boundary: backend errors, panics,
//! timeouts and unusable output all come back as a `Failed` result instead of
//! an error, so one bad unit never aborts a stream.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    audio::{self, AudioFrame},
    cache::{CacheStats, UnitCache},
    pool::WorkerSlot,
    unit::{SynthesisRequest, SynthesisResult, VoiceRef},
};

/// Text-to-audio backend. Called from a blocking worker thread; may take
/// seconds per call and may return several frames for one unit.
pub trait SynthesisBackend: Send + Sync + 'static {
    fn synthesize(&self, text: &str, voice: &VoiceRef, speed: f32)
        -> anyhow::Result<Vec<AudioFrame>>;

    /// Whether `voice` can be served at all. Checked once before a stream
    /// starts.
    fn has_voice(&self, _voice: &VoiceRef) -> bool {
        true
    }

    /// Language keys this backend can serve.
    fn languages(&self) -> Vec<String> {
        Vec::new()
    }

    fn voice_details(&self) -> Vec<VoiceDetail> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceDetail {
    pub language: String,
    pub voice: Option<String>,
    pub config: String,
    pub speaker: Option<i64>,
    pub display_name: Option<String>,
    pub is_default: bool,
}

pub const TIMEOUT_REASON: &str = "timeout";

pub struct UnitSynthesizer {
    backend: Arc<dyn SynthesisBackend>,
    timeout: Duration,
    normalize_target_dbfs: f32,
    cache: Option<UnitCache>,
}

impl UnitSynthesizer {
    pub fn new(backend: Arc<dyn SynthesisBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            normalize_target_dbfs: -3.0,
            cache: None,
        }
    }

    pub fn with_normalize_target(mut self, dbfs: f32) -> Self {
        self.normalize_target_dbfs = dbfs;
        self
    }

    pub fn with_cache(mut self, cache: Option<UnitCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn backend(&self) -> &Arc<dyn SynthesisBackend> {
        &self.backend
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.as_ref().map(UnitCache::stats).unwrap_or_default()
    }

    /// Serve a unit from the cache without touching a worker.
    pub async fn lookup(&self, req: &SynthesisRequest) -> Option<SynthesisResult> {
        let frames = self.cache.as_ref()?.get(req).await?;
        let mut result = SynthesisResult::ok(req.unit.clone(), frames, Duration::ZERO);
        result.cached = true;
        Some(result)
    }

    /// Run one backend call on `slot` and convert every failure mode into a
    /// `Failed` result. Returns after at most the configured timeout; a timed
    /// out call keeps its worker until the backend returns.
    pub async fn synthesize_unit(&self, req: SynthesisRequest, slot: WorkerSlot) -> SynthesisResult {
        let started = Instant::now();
        let index = req.unit.index;
        if req.unit.text.trim().is_empty() {
            return SynthesisResult::failed(req.unit, "empty text", Duration::ZERO);
        }

        let backend = self.backend.clone();
        let text = req.unit.text.clone();
        let voice = req.voice.clone();
        let speed = req.speed;
        let handle = slot.spawn(move || backend.synthesize(&text, &voice, speed));

        let frames = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(frames))) => frames,
            Ok(Ok(Err(e))) => {
                warn!(index, error = %e, "unit synthesis failed");
                return SynthesisResult::failed(req.unit, format!("backend error: {e}"), started.elapsed());
            }
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    "backend panicked"
                } else {
                    "worker aborted"
                };
                warn!(index, reason, "unit synthesis failed");
                return SynthesisResult::failed(req.unit, reason, started.elapsed());
            }
            Err(_) => {
                warn!(index, timeout_ms = self.timeout.as_millis() as u64, "unit synthesis timed out");
                return SynthesisResult::failed(req.unit, TIMEOUT_REASON, started.elapsed());
            }
        };

        let result = self.finish(&req, frames, started.elapsed());
        if result.is_ok() {
            if let Some(cache) = &self.cache {
                cache.put(&req, &result.frames).await;
            }
        }
        result
    }

    fn finish(&self, req: &SynthesisRequest, mut frames: Vec<AudioFrame>, elapsed: Duration) -> SynthesisResult {
        let unit = req.unit.clone();
        if frames.iter().all(|f| f.samples.is_empty()) {
            return SynthesisResult::failed(unit, "empty output", elapsed);
        }
        frames.retain(|f| !f.samples.is_empty());
        if audio::common_sample_rate(&frames).is_none() {
            return SynthesisResult::failed(unit, "inconsistent sample rates", elapsed);
        }
        if req.normalize && audio::normalize_peak(&mut frames, self.normalize_target_dbfs).is_none() {
            debug!(index = unit.index, "silent unit, normalization skipped");
        }
        debug!(index = unit.index, elapsed_ms = elapsed.as_millis() as u64, frames = frames.len(), "unit synthesized");
        SynthesisResult::ok(unit, frames, elapsed)
    }
}
