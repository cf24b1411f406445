//! Common utilities for integration tests

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;
use tts_core::{AudioFrame, SynthesisBackend, VoiceDetail, VoiceRef};

use server::{build_app, config::ServerConfig, AppState};

pub const SAMPLE_RATE: u32 = 22_050;

/// In-memory backend: 100 samples per unit, fails on any text containing
/// "broken".
pub struct MockBackend {
    delay: Duration,
    calls: AtomicUsize,
    loaded: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(5))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            loaded: true,
        }
    }

    /// A backend whose voice map failed to load.
    pub fn without_voices() -> Self {
        Self {
            loaded: false,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SynthesisBackend for MockBackend {
    fn synthesize(&self, text: &str, _voice: &VoiceRef, _speed: f32) -> anyhow::Result<Vec<AudioFrame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("broken") {
            anyhow::bail!("mock model rejected input");
        }
        std::thread::sleep(self.delay);
        Ok(vec![AudioFrame::new(vec![0.25; 100], SAMPLE_RATE)])
    }

    fn has_voice(&self, voice: &VoiceRef) -> bool {
        self.languages().contains(&voice.language)
            && voice.voice.as_deref().map_or(true, |v| v == "lessac")
    }

    fn languages(&self) -> Vec<String> {
        if !self.loaded {
            return Vec::new();
        }
        vec!["de_DE".to_string(), "en_US".to_string()]
    }

    fn voice_details(&self) -> Vec<VoiceDetail> {
        vec![VoiceDetail {
            language: "en_US".to_string(),
            voice: Some("lessac".to_string()),
            config: "models/en_US/lessac.onnx.json".to_string(),
            speaker: None,
            display_name: Some("Lessac".to_string()),
            is_default: true,
        }]
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        rate_limit_per_minute: 600,
        max_text_length: 200,
        unit_cache_capacity: 0,
        ..ServerConfig::default()
    }
}

pub fn create_test_state() -> AppState {
    AppState::new(Arc::new(MockBackend::new()), test_config())
}

/// Create a test app instance
pub fn create_test_app() -> Router {
    build_app(create_test_state()).expect("test app builds")
}

pub async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

pub fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.oneshot(json_request(uri, body)).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

/// `(event name, data JSON)` for every event in an SSE body.
pub fn parse_sse(body: &[u8]) -> Vec<(String, Value)> {
    let text = String::from_utf8_lossy(body);
    text.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = serde_json::from_str(v.trim()).ok();
                }
            }
            Some((name?, data?))
        })
        .collect()
}
