use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, warn};

use server::{build_app, config::ServerConfig, AppState};
use tts_core::{SynthesisBackend, TtsManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting streaming TTS server...");

    let config = ServerConfig::from_env();

    info!("Loading voice map from {}", config.model_map_path);
    let tts = TtsManager::new_from_mapfile(&config.model_map_path).unwrap_or_else(|e| {
        warn!("Could not load {}: {e}, using empty map.", config.model_map_path);
        TtsManager::new(HashMap::new())
    });
    info!("Loaded {} TTS voices", tts.list_languages().len());

    let backend: Arc<dyn SynthesisBackend> = Arc::new(tts);
    let state = AppState::new(backend, config.clone());
    info!(
        port = config.port,
        rate_limit = config.rate_limit_per_minute,
        window = config.prefetch_window,
        workers = config.worker_count,
        shared_pool = config.share_worker_pool,
        "Server configuration loaded"
    );

    let app = build_app(state)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
