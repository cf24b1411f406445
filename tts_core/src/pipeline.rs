//! `StreamPipeline`: segment -> prefetch scheduler -> ordered emitter ->
//! transport sink, with request-scoped state and teardown on every exit.

use std::{
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cache::{CacheStats, UnitCache},
    emitter::{OrderedEmitter, StreamOutcome, StreamReport},
    pool::WorkerPool,
    scheduler::PrefetchScheduler,
    segment::segment,
    sink::{CollectingSink, TransportSink},
    synth::{SynthesisBackend, UnitSynthesizer},
    unit::SynthesisParams,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Units allowed in flight or completed-but-unemitted beyond the one due
    /// for emission.
    pub prefetch_window: usize,
    pub worker_count: usize,
    pub unit_timeout: Duration,
    pub stream_timeout: Option<Duration>,
    /// Share one worker pool across all streams instead of one per stream.
    pub shared_pool: bool,
    /// Unit cache entries; 0 disables the cache.
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub normalize_target_dbfs: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch_window: 2,
            worker_count: 2,
            unit_timeout: Duration::from_secs(30),
            stream_timeout: Some(Duration::from_secs(300)),
            shared_pool: false,
            cache_capacity: 500,
            cache_ttl: Duration::from_secs(3600),
            normalize_target_dbfs: -3.0,
        }
    }
}

pub struct StreamPipeline {
    synth: Arc<UnitSynthesizer>,
    config: PipelineConfig,
    shared_pool: Option<WorkerPool>,
    active_calls: Arc<AtomicUsize>,
}

impl StreamPipeline {
    pub fn new(backend: Arc<dyn SynthesisBackend>, config: PipelineConfig) -> Self {
        let cache = UnitCache::new(config.cache_capacity, config.cache_ttl);
        let synth = UnitSynthesizer::new(backend, config.unit_timeout)
            .with_normalize_target(config.normalize_target_dbfs)
            .with_cache(cache);
        let active_calls = Arc::new(AtomicUsize::new(0));
        let shared_pool = config
            .shared_pool
            .then(|| WorkerPool::with_counter(config.worker_count, active_calls.clone()));

        Self {
            synth: Arc::new(synth),
            config,
            shared_pool,
            active_calls,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SynthesisBackend> {
        self.synth.backend()
    }

    /// Backend calls running right now, across every stream.
    pub fn active_backend_calls(&self) -> usize {
        self.active_calls.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.synth.cache_stats()
    }

    fn pool_for_stream(&self) -> WorkerPool {
        match &self.shared_pool {
            Some(pool) => pool.clone(),
            None => WorkerPool::with_counter(self.config.worker_count, self.active_calls.clone()),
        }
    }

    /// Stream `text` to `sink` in unit order until completion, cancellation,
    /// the stream deadline, or a transport failure. All per-unit problems
    /// are reported in-band; the returned report says how the stream ended.
    pub async fn run<S: TransportSink + ?Sized>(
        &self,
        text: &str,
        params: SynthesisParams,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> StreamReport {
        let units = segment(text);
        let pool = self.pool_for_stream();
        info!(
            units = units.len(),
            voice = %params.voice,
            speed = params.speed,
            window = self.config.prefetch_window,
            workers = pool.size(),
            "stream started"
        );
        let scheduler = PrefetchScheduler::new(
            units,
            params,
            self.synth.clone(),
            pool,
            self.config.prefetch_window,
        );
        let deadline = self.config.stream_timeout.map(|t| Instant::now() + t);
        OrderedEmitter::new(scheduler, sink, cancel, deadline).run().await
    }

    /// Synthesize the whole text into one clip (units joined with short
    /// pauses). Fails if any unit fails.
    pub async fn synthesize_all(
        &self,
        text: &str,
        params: SynthesisParams,
    ) -> anyhow::Result<(Vec<f32>, u32, StreamReport)> {
        let mut sink = CollectingSink::new();
        let report = self.run(text, params, &mut sink, CancellationToken::new()).await;
        match &report.outcome {
            StreamOutcome::Completed => {}
            StreamOutcome::TimedOut => return Err(anyhow::anyhow!("synthesis timed out")),
            StreamOutcome::Cancelled => return Err(anyhow::anyhow!("synthesis cancelled")),
            StreamOutcome::Failed(reason) => return Err(anyhow::anyhow!("synthesis failed: {reason}")),
        }
        let (samples, sample_rate) = sink.into_audio()?;
        Ok((samples, sample_rate, report))
    }
}
