pub mod audio;
pub mod cache;
pub mod emitter;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod scheduler;
pub mod segment;
pub mod sink;
pub mod synth;
pub mod unit;
pub mod wav;

use std::{collections::HashMap, fs, path::Path, sync::{Arc, RwLock}, time::Instant};

use anyhow::Context;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use audio::AudioFrame;
pub use emitter::{EmitterPhase, StreamOutcome, StreamReport};
pub use models::ModelCache;
pub use pipeline::{PipelineConfig, StreamPipeline};
pub use pool::WorkerPool;
pub use segment::segment;
pub use sink::{
    event_stream, ChannelSink, ChunkEvent, CollectingSink, EmitMeta, SinkError, StreamEvent, TransportSink,
};
pub use synth::{SynthesisBackend, UnitSynthesizer, VoiceDetail};
pub use unit::{SynthesisParams, SynthesisRequest, SynthesisResult, SynthesisUnit, UnitOutcome, VoiceRef};
pub use wav::{encode_wav, encode_wav_base64};

/// Models kept loaded at once; the least recently used is evicted beyond this.
const DEFAULT_MAX_LOADED_MODELS: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceEntry {
    pub config: String,
    pub speaker_id: Option<i64>,
    pub display_name: Option<String>,
    pub gender: Option<String>,
    pub quality: Option<String>,
}

/// Piper-backed voice registry: resolves a [`VoiceRef`] to a model config
/// and keeps loaded synthesizers cached.
#[derive(Debug, Clone)]
pub struct TtsManager {
    // Legacy format: language key -> (config path, default speaker)
    pub(crate) map: HashMap<String, (String, Option<i64>)>,
    // Multi-voice format: language -> (default_voice_id, voices_map)
    pub(crate) voices_map: HashMap<String, (String, HashMap<String, VoiceEntry>)>,
    // config path -> loaded synthesizer; RwLock since synthesis only needs shared access
    cache: Arc<ModelCache<RwLock<PiperSpeechSynthesizer>>>,
}

impl TtsManager {
    /// Create from a prebuilt legacy map
    pub fn new(map: HashMap<String, (String, Option<i64>)>) -> Self {
        Self::new_with_cache_size(map, DEFAULT_MAX_LOADED_MODELS)
    }

    pub fn new_with_cache_size(map: HashMap<String, (String, Option<i64>)>, max_cache_size: usize) -> Self {
        Self {
            map,
            voices_map: HashMap::new(),
            cache: Arc::new(ModelCache::new(max_cache_size)),
        }
    }

    /// Load from `models/map.json`
    pub fn new_from_mapfile<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to load {}", p.as_ref().display()))?;
        Self::from_map_json(&text)
    }

    /// Parse a voice map. Supports both the multi-voice format
    /// (`{ "default_voice", "voices": {...} }` per language) and the legacy
    /// format (config path string or `{ "config", "default_speaker" }`).
    pub fn from_map_json(text: &str) -> anyhow::Result<Self> {
        let json: serde_json::Value = serde_json::from_str(text)
            .with_context(|| "map.json is not valid JSON")?;
        let obj = json
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("map.json must be a JSON object"))?;

        let mut map: HashMap<String, (String, Option<i64>)> = HashMap::new();
        let mut voices_map: HashMap<String, (String, HashMap<String, VoiceEntry>)> = HashMap::new();

        for (lang, v) in obj {
            match v {
                serde_json::Value::Object(o) if o.contains_key("voices") => {
                    let default_voice = o
                        .get("default_voice")
                        .and_then(|x| x.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing 'default_voice' for language {}", lang))?
                        .to_string();
                    let voices_obj = o
                        .get("voices")
                        .and_then(|x| x.as_object())
                        .ok_or_else(|| anyhow::anyhow!("missing 'voices' object for language {}", lang))?;

                    let mut voices: HashMap<String, VoiceEntry> = HashMap::new();
                    for (voice_id, voice_data) in voices_obj {
                        let entry: VoiceEntry = serde_json::from_value(voice_data.clone())
                            .with_context(|| format!("invalid entry for voice {}", voice_id))?;
                        // default voice also backs the legacy map
                        if voice_id == &default_voice {
                            map.insert(lang.clone(), (entry.config.clone(), entry.speaker_id));
                        }
                        voices.insert(voice_id.clone(), entry);
                    }
                    if !voices.contains_key(&default_voice) {
                        return Err(anyhow::anyhow!(
                            "default voice '{}' for language {} is not in its voices",
                            default_voice,
                            lang
                        ));
                    }
                    voices_map.insert(lang.clone(), (default_voice, voices));
                }
                serde_json::Value::Object(o) => {
                    let config = o
                        .get("config")
                        .and_then(|x| x.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing 'config' for key {}", lang))?
                        .to_string();
                    let spk = o.get("default_speaker").and_then(|x| x.as_i64());
                    map.insert(lang.clone(), (config, spk));
                }
                serde_json::Value::String(path) => {
                    map.insert(lang.clone(), (path.clone(), None));
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "invalid entry for key {} (expected string or object)",
                        lang
                    ));
                }
            }
        }

        Ok(Self {
            map,
            voices_map,
            cache: Arc::new(ModelCache::new(DEFAULT_MAX_LOADED_MODELS)),
        })
    }

    /// List supported language keys
    pub fn list_languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.map.keys().cloned().collect();
        for lang in self.voices_map.keys() {
            if !langs.contains(lang) {
                langs.push(lang.clone());
            }
        }
        langs.sort();
        langs
    }

    /// Resolve config path and speaker for a voice. A named voice must
    /// exist in the multi-voice map; a bare language uses its default voice.
    pub fn config_for(&self, voice: &VoiceRef) -> anyhow::Result<(String, Option<i64>)> {
        let lang = voice.language.as_str();
        if let Some((default_voice, voices)) = self.voices_map.get(lang) {
            let voice_id = voice.voice.as_deref().unwrap_or(default_voice);
            if let Some(entry) = voices.get(voice_id) {
                return Ok((entry.config.clone(), entry.speaker_id));
            }
            let mut known: Vec<&str> = voices.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(anyhow::anyhow!(
                "Unknown voice '{}' for language '{}'. Available voices: {}",
                voice_id,
                lang,
                known.join(", ")
            ));
        }
        if let Some(name) = &voice.voice {
            return Err(anyhow::anyhow!("Language '{lang}' has no named voice '{name}'"));
        }
        self.map
            .get(lang)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown language key: {lang}. Use /voices to list."))
    }

    /// Read sample rate from model config JSON
    fn read_sample_rate<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<u32> {
        let text = fs::read_to_string(cfg_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", cfg_path.as_ref().display()))?;
        let json: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| "Config file is not valid JSON")?;

        let sample_rate = json
            .get("audio")
            .and_then(|a| a.get("sample_rate"))
            .and_then(|sr| sr.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;

        Ok(sample_rate as u32)
    }

    /// Get or create a cached synthesizer for a config path
    pub fn get_or_create_synth<P: AsRef<Path>>(
        &self,
        cfg_path: P,
    ) -> anyhow::Result<(Arc<RwLock<PiperSpeechSynthesizer>>, u32)> {
        let cfg_path = cfg_path.as_ref();
        let key = cfg_path.to_string_lossy();
        self.cache.get_or_load(&key, || {
            let sample_rate = Self::read_sample_rate(cfg_path)?;
            let started = Instant::now();
            let model = piper_rs::from_config_path(cfg_path).map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
            let synth = PiperSpeechSynthesizer::new(model)?;
            info!(config = %key, sample_rate, load_ms = started.elapsed().as_millis() as u64, "voice model loaded");
            Ok((RwLock::new(synth), sample_rate))
        })
    }
}

impl SynthesisBackend for TtsManager {
    fn synthesize(&self, text: &str, voice: &VoiceRef, speed: f32) -> anyhow::Result<Vec<AudioFrame>> {
        let (cfg_path, _speaker) = self.config_for(voice)?;
        let (synth_arc, sample_rate) = self.get_or_create_synth(&cfg_path)?;
        let synth = synth_arc.read().map_err(|_| {
            anyhow::anyhow!("Synthesizer lock poisoned - this indicates a previous panic. Please restart the server.")
        })?;

        let iter: PiperSpeechStreamParallel = synth
            .synthesize_parallel(text.to_string(), None)
            .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;

        let mut frames = Vec::new();
        for part in iter {
            let samples = part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?.into_vec();
            frames.push(AudioFrame::new(audio::time_scale(&samples, speed), sample_rate));
        }
        Ok(frames)
    }

    fn has_voice(&self, voice: &VoiceRef) -> bool {
        self.config_for(voice).is_ok()
    }

    fn languages(&self) -> Vec<String> {
        self.list_languages()
    }

    fn voice_details(&self) -> Vec<VoiceDetail> {
        let mut out = Vec::new();
        for (lang, (default_voice, voices)) in &self.voices_map {
            for (id, entry) in voices {
                out.push(VoiceDetail {
                    language: lang.clone(),
                    voice: Some(id.clone()),
                    config: entry.config.clone(),
                    speaker: entry.speaker_id,
                    display_name: entry.display_name.clone(),
                    is_default: id == default_voice,
                });
            }
        }
        for (lang, (config, speaker)) in &self.map {
            if self.voices_map.contains_key(lang) {
                continue;
            }
            out.push(VoiceDetail {
                language: lang.clone(),
                voice: None,
                config: config.clone(),
                speaker: *speaker,
                display_name: None,
                is_default: true,
            });
        }
        out.sort_by(|a, b| (&a.language, &a.voice).cmp(&(&b.language, &b.voice)));
        out
    }
}
