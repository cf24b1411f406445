// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::{emitter::StreamOutcome, StreamReport};

/// Samples kept for percentile calculation.
const MAX_SAMPLES: usize = 1000;

/// Rolling latency window with count, average and percentiles.
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    count: Arc<AtomicU64>,
    total_ms: Arc<AtomicU64>,
    samples: Arc<Mutex<Vec<u64>>>,
}

impl LatencyWindow {
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(ms);
            if samples.len() > MAX_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn snapshot(&self) -> LatencyStats {
        LatencyStats {
            count: self.count(),
            avg_ms: self.avg_ms(),
            p50_ms: self.percentile(50),
            p95_ms: self.percentile(95),
        }
    }
}

/// Stream lifecycle and per-unit counters.
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub started: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub timed_out: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub units_succeeded: Arc<AtomicU64>,
    pub units_failed: Arc<AtomicU64>,
    pub time_to_first_chunk: LatencyWindow,
}

impl StreamMetrics {
    pub fn stream_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report(&self, report: &StreamReport) {
        let counter = match report.outcome {
            StreamOutcome::Completed => &self.completed,
            StreamOutcome::Cancelled => &self.cancelled,
            StreamOutcome::TimedOut => &self.timed_out,
            StreamOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.units_succeeded
            .fetch_add(report.succeeded as u64, Ordering::Relaxed);
        self.units_failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        if let Some(latency) = report.first_chunk_latency {
            self.time_to_first_chunk.record(latency);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub streams: StreamMetrics,
    /// Whole-request latency of one-shot synthesis.
    pub one_shot: LatencyWindow,
    pub one_shot_errors: Arc<AtomicU64>,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub streams: StreamStats,
    pub one_shot: OneShotStats,
    pub cache: CacheStatsResponse,
    pub active_backend_calls: usize,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct StreamStats {
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub time_to_first_chunk: LatencyStats,
}

#[derive(Serialize)]
pub struct OneShotStats {
    pub errors: u64,
    pub latency: LatencyStats,
}

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl StreamMetrics {
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            time_to_first_chunk: self.time_to_first_chunk.snapshot(),
        }
    }
}

pub fn system_metrics(request_count: u64, uptime: Duration) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let system_load = if cfg!(unix) {
        Some(sysinfo::System::load_average().one)
    } else {
        None
    };

    SystemMetrics {
        cpu_usage_percent: system.global_cpu_info().cpu_usage(),
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count,
        uptime_seconds: uptime.as_secs(),
        system_load,
    }
}
