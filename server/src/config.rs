// Server configuration, read from the environment

use std::time::Duration;

use tts_core::PipelineConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub model_map_path: String,
    pub prefetch_window: usize,
    pub worker_count: usize,
    pub unit_timeout_secs: u64,
    /// 0 disables the whole-stream deadline.
    pub stream_timeout_secs: u64,
    pub share_worker_pool: bool,
    pub unit_cache_capacity: usize,
    pub max_text_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            model_map_path: "models/map.json".to_string(),
            prefetch_window: 2,
            worker_count: 2,
            unit_timeout_secs: 30,
            stream_timeout_secs: 300,
            share_worker_pool: false,
            unit_cache_capacity: 500,
            max_text_length: 5000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| parse_origins(&origins));

        let share_worker_pool = std::env::var("SHARE_WORKER_POOL")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(defaults.share_worker_pool);

        Self {
            port: env_or("PORT", defaults.port),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            model_map_path: std::env::var("MODEL_MAP_PATH").unwrap_or(defaults.model_map_path),
            prefetch_window: env_or("PREFETCH_WINDOW", defaults.prefetch_window),
            worker_count: env_or("WORKER_COUNT", defaults.worker_count),
            unit_timeout_secs: env_or("UNIT_TIMEOUT_SECS", defaults.unit_timeout_secs),
            stream_timeout_secs: env_or("STREAM_TIMEOUT_SECS", defaults.stream_timeout_secs),
            share_worker_pool,
            unit_cache_capacity: env_or("UNIT_CACHE_CAPACITY", defaults.unit_cache_capacity),
            max_text_length: env_or("MAX_TEXT_LENGTH", defaults.max_text_length),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            prefetch_window: self.prefetch_window,
            worker_count: self.worker_count.max(1),
            unit_timeout: Duration::from_secs(self.unit_timeout_secs.max(1)),
            stream_timeout: (self.stream_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stream_timeout_secs)),
            shared_pool: self.share_worker_pool,
            cache_capacity: self.unit_cache_capacity,
            ..PipelineConfig::default()
        }
    }
}
