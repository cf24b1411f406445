pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod stream;
pub mod validation;

use std::{
    sync::{atomic::AtomicU64, Arc},
    time::Instant,
};

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tts_core::{StreamPipeline, SynthesisBackend, SynthesisParams};

use crate::{
    config::ServerConfig,
    error::ApiError,
    metrics::AppMetrics,
    validation::{validate_speak_request, EmptyText, SpeakRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<StreamPipeline>,
    pub config: ServerConfig,
    pub request_count: Arc<AtomicU64>,
    pub metrics: AppMetrics,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(backend: Arc<dyn SynthesisBackend>, config: ServerConfig) -> Self {
        let pipeline = StreamPipeline::new(backend, config.pipeline_config());
        Self {
            pipeline: Arc::new(pipeline),
            config,
            request_count: Arc::new(AtomicU64::new(0)),
            metrics: AppMetrics::new(),
            started_at: Instant::now(),
        }
    }

    /// Validate a request and make sure its voice exists, so unknown voices
    /// are refused before any stream starts.
    pub fn resolve_params(&self, req: &SpeakRequest, empty: EmptyText) -> Result<SynthesisParams, ApiError> {
        let backend = self.pipeline.backend();
        let default_language = backend.languages().into_iter().next();
        let params = validate_speak_request(
            req,
            self.config.max_text_length,
            default_language.as_deref(),
            empty,
        )?;
        if !backend.has_voice(&params.voice) {
            return Err(ApiError::NotFound(format!("Unknown voice: {}", params.voice)));
        }
        Ok(params)
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let permissive = || {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods.clone())
            .allow_headers(Any)
            .allow_credentials(false)
    };

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return permissive();
    };
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        return permissive();
    }
    info!("CORS configured for {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(Any)
        .allow_credentials(false)
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let Ok(value) = HeaderValue::from_str(&request_id) else {
        return next.run(request).await;
    };
    request.headers_mut().insert("x-request-id", value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-request-id", value);
    response
}

fn api_routes() -> Router<AppState> {
    let public_api = Router::new()
        .route("/health", get(routes::health_check))
        .route("/healthz", get(routes::health_check))
        .route("/voices", get(routes::list_voices))
        .route("/voices/detail", get(routes::list_voices_detail))
        .route("/tts", post(routes::tts_endpoint))
        .route("/synthesize", post(routes::synthesize_wav))
        .route("/tts/stream", post(stream::tts_stream_sse))
        .route("/stream", get(stream::stream_ws));

    // Metrics endpoint - consider adding authentication in production
    let metrics_api = Router::new().route("/metrics", get(routes::metrics_endpoint));

    Router::new().merge(public_api).merge(metrics_api)
}

/// Full application: every route at the root and under `/api`, wrapped in
/// request-id, tracing, rate limiting, timeout and CORS layers.
pub fn build_app(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    // Global key: all clients share one budget, which behaves behind proxies
    let per_request_ms = (60_000 / config.rate_limit_per_minute.max(1)).max(1) as u64;
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(per_request_ms)
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    // The timeout bounds time-to-response; streaming bodies are governed by
    // the stream deadline instead.
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    let api = api_routes();
    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
