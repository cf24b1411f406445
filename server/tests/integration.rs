//! Integration tests for the HTTP surface

mod common;

use std::{sync::Arc, time::Duration};

use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use server::{build_app, AppState};

#[tokio::test]
async fn test_health_check() {
    for uri in ["/health", "/healthz", "/api/health"] {
        let (status, body) = get(create_test_app(), uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body, b"ok");
    }
}

#[tokio::test]
async fn test_health_reports_unavailable_without_voices() {
    let state = AppState::new(Arc::new(MockBackend::without_voices()), test_config());
    let app = build_app(state).unwrap();

    let (status, body) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["code"], 503);
    assert!(err["error"].as_str().unwrap().contains("No voices loaded"));

    let (status, _, _) = post_json(app, "/tts", json!({ "text": "Hi." })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_list_voices() {
    let (status, body) = get(create_test_app(), "/voices").await;
    assert_eq!(status, StatusCode::OK);
    let voices: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(voices, vec!["de_DE", "en_US"]);

    let (status, body) = get(create_test_app(), "/api/voices/detail").await;
    assert_eq!(status, StatusCode::OK);
    let detail: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(detail[0]["voice"], "lessac");
    assert_eq!(detail[0]["is_default"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sse_stream_emits_in_order() {
    let (status, headers, body) = post_json(
        create_test_app(),
        "/tts/stream",
        json!({ "text": "Hello world. This is a test! Final sentence?", "voice": "en_US" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/event-stream"));
    assert!(headers.contains_key("x-request-id"));

    let events = parse_sse(&body);
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["chunk", "chunk", "chunk", "complete"]);

    for (i, (_, data)) in events[..3].iter().enumerate() {
        assert_eq!(data["event"], "chunk");
        assert_eq!(data["sentence_index"], i);
        assert_eq!(data["chunk_index"], i);
        assert_eq!(data["total_sentences"], 3);
        assert_eq!(data["sample_rate"], SAMPLE_RATE);
        assert_eq!(data["audio_size"], 44 + 200);
        assert_eq!(data["is_final"], i == 2);
        assert!(data.get("error").is_none());
    }
    assert_eq!(events[0].1["text"], "Hello world.");
    assert_eq!(events[3].1, json!({ "event": "complete", "total_chunks": 3 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sse_stream_reports_failed_units_in_place() {
    let (status, _, body) = post_json(
        create_test_app(),
        "/api/tts/stream",
        json!({ "text": "Fine. This one is broken. Also fine." }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_eq!(events.len(), 4);
    let failed = &events[1].1;
    assert_eq!(failed["sentence_index"], 1);
    assert!(failed["error"].as_str().unwrap().contains("mock model rejected input"));
    assert_eq!(failed["audio"], "");
    assert_eq!(failed["audio_size"], 0);
    assert!(failed.get("chunk_index").is_none());
    assert_eq!(events[2].1["chunk_index"], 1);
    assert_eq!(events[3].1["total_chunks"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sse_client_disconnect_cancels_stream() {
    let backend = Arc::new(MockBackend::with_delay(Duration::from_millis(50)));
    let state = AppState::new(backend.clone(), test_config());
    let app = build_app(state.clone()).unwrap();
    let text: String = (0..20).map(|i| format!("Unit {i}. ")).collect();

    let response = app.oneshot(json_request("/tts/stream", json!({ "text": text }))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("chunk"));

    // client goes away after the first event
    drop(body);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = state.metrics.streams.snapshot();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.cancelled + stats.failed, 1);
    assert_eq!(state.pipeline.active_backend_calls(), 0);
    assert!(backend.calls() < 20, "backend ran {} units after disconnect", backend.calls());
}

#[tokio::test]
async fn test_sse_stream_empty_text_completes_immediately() {
    let (status, _, body) = post_json(create_test_app(), "/tts/stream", json!({ "text": "   " })).await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "complete");
    assert_eq!(events[0].1["total_chunks"], 0);
}

#[tokio::test]
async fn test_stream_rejects_bad_requests_before_starting() {
    let cases = [
        (json!({ "text": "Hi.", "voice": "fr_FR" }), StatusCode::NOT_FOUND),
        (json!({ "text": "Hi.", "voice": "en_US/unknown" }), StatusCode::NOT_FOUND),
        (json!({ "text": "Hi.", "voice": "english" }), StatusCode::BAD_REQUEST),
        (json!({ "text": "Hi.", "speed": 0.0 }), StatusCode::BAD_REQUEST),
        (json!({ "text": "Hi.", "speed": 9.0 }), StatusCode::BAD_REQUEST),
        (json!({ "text": "a".repeat(500) }), StatusCode::BAD_REQUEST),
    ];
    for (body, expected) in cases {
        let (status, _, raw) = post_json(create_test_app(), "/tts/stream", body.clone()).await;
        assert_eq!(status, expected, "{body}");
        let err: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(err["code"], expected.as_u16());
        assert!(err["error"].is_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tts_endpoint_success() {
    let (status, _, body) = post_json(
        create_test_app(),
        "/tts",
        json!({ "text": "One. Two.", "voice": "de_DE", "speed": 1.0 }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let resp: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(resp["sample_rate"], SAMPLE_RATE);
    assert_eq!(resp["sentences"], 2);
    assert!(!resp["audio_base64"].as_str().unwrap().is_empty());
    // 200 samples of speech plus a 400 ms pause
    let expected_ms = ((200 + 8820) as f64 / SAMPLE_RATE as f64 * 1000.0) as u64;
    assert_eq!(resp["duration_ms"], expected_ms);
}

#[tokio::test]
async fn test_tts_endpoint_empty_text() {
    let (status, _, body) = post_json(create_test_app(), "/tts", json!({ "text": "" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert!(err["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tts_endpoint_fails_on_failed_sentence() {
    let (status, _, body) =
        post_json(create_test_app(), "/tts", json!({ "text": "Good. Something broken here." })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["code"], 500);
    assert!(err["error"].as_str().unwrap().contains("mock model rejected input"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_synthesize_returns_wav() {
    let (status, headers, body) =
        post_json(create_test_app(), "/synthesize", json!({ "text": "Just one sentence." })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "audio/wav");
    assert_eq!(&body[..4], b"RIFF");
    assert_eq!(&body[8..12], b"WAVE");
    assert_eq!(body.len(), 44 + 200);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (status, body) = get(create_test_app(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let metrics: Value = serde_json::from_slice(&body).unwrap();
    assert!(metrics["timestamp"].is_string());
    assert!(metrics["system"]["memory_total_mb"].is_number());
    assert_eq!(metrics["streams"]["started"], 0);
    assert_eq!(metrics["active_backend_calls"], 0);
    assert_eq!(metrics["cache"]["hits"], 0);
    assert!(metrics["streams"]["time_to_first_chunk"]["p95_ms"].is_number());
}

#[test]
fn test_ws_opening_message_is_validated() {
    let state = create_test_state();
    let (req, params) =
        server::stream::parse_ws_request(&state, r#"{"text":"Hi there.","voice":"en_US/lessac","speed":1.25}"#).unwrap();
    assert_eq!(req.text, "Hi there.");
    assert_eq!(params.voice.voice.as_deref(), Some("lessac"));
    assert_eq!(params.speed, 1.25);

    assert!(server::stream::parse_ws_request(&state, "not json").is_err());
    assert!(server::stream::parse_ws_request(&state, r#"{"text":"x","voice":"xx_XX"}"#).is_err());
}
