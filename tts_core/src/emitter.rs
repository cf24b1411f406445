//! Ordered emitter: re-imposes segmentation order on out-of-order worker
//! completions and drives the scheduler's refill.
//!
//! Phases: `Idle -> Streaming -> {Completed, Cancelled, Failed}`. Completed
//! results are parked in a sparse `pending` map until every predecessor has
//! been emitted; each emission advances `next_to_emit` and refills the
//! prefetch window. Unit failures are emitted in place as failed markers and
//! never end the stream; only cancellation, the stream deadline, or a
//! transport error do.

use std::{collections::BTreeMap, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    scheduler::PrefetchScheduler,
    sink::{EmitMeta, SinkError, TransportSink},
    unit::SynthesisResult,
};

/// How long a best-effort terminal error may wait on a stalled transport.
const TERMINAL_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEADLINE_REASON: &str = "stream deadline exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterPhase {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// Request-scoped state, owned by exactly one emitter.
#[derive(Debug)]
pub struct StreamState {
    pub phase: EmitterPhase,
    pub next_to_emit: usize,
    pub pending: BTreeMap<usize, SynthesisResult>,
    pub in_flight: usize,
    pub cancelled: bool,
    pub succeeded: usize,
    pub failed: usize,
}

impl StreamState {
    fn new() -> Self {
        Self {
            phase: EmitterPhase::Idle,
            next_to_emit: 0,
            pending: BTreeMap::new(),
            in_flight: 0,
            cancelled: false,
            succeeded: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Client disconnect or explicit stop.
    Cancelled,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub total_units: usize,
    /// Units emitted, failed markers included.
    pub emitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Time from stream start to the first emitted unit.
    pub first_chunk_latency: Option<Duration>,
}

enum Wake {
    Cancelled,
    Deadline,
    Completion(Option<SynthesisResult>),
}

pub struct OrderedEmitter<'s, S: TransportSink + ?Sized> {
    scheduler: PrefetchScheduler,
    sink: &'s mut S,
    state: StreamState,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
    first_chunk_latency: Option<Duration>,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<'s, S: TransportSink + ?Sized> OrderedEmitter<'s, S> {
    pub fn new(
        scheduler: PrefetchScheduler,
        sink: &'s mut S,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            scheduler,
            sink,
            state: StreamState::new(),
            cancel,
            deadline,
            started: Instant::now(),
            first_chunk_latency: None,
        }
    }

    pub async fn run(mut self) -> StreamReport {
        let total = self.scheduler.total();
        if total == 0 {
            return self.complete().await;
        }
        if self.cancel.is_cancelled() {
            return self.abort(StreamOutcome::Cancelled).await;
        }

        self.scheduler.refill(0);
        self.state.phase = EmitterPhase::Streaming;

        let deadline = wait_deadline(self.deadline);
        tokio::pin!(deadline);

        while self.state.next_to_emit < total {
            self.state.in_flight = self.scheduler.in_flight();
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = &mut deadline => Wake::Deadline,
                c = self.scheduler.next_completion() => Wake::Completion(c),
            };

            match wake {
                Wake::Cancelled => return self.abort(StreamOutcome::Cancelled).await,
                Wake::Deadline => return self.abort(StreamOutcome::TimedOut).await,
                Wake::Completion(None) => {
                    let reason = format!("unit {} was lost by the scheduler", self.state.next_to_emit);
                    return self.fail(reason, true).await;
                }
                Wake::Completion(Some(result)) => {
                    debug!(index = result.index, next = self.state.next_to_emit, "unit completed");
                    self.state.pending.insert(result.index, result);
                }
            }

            // drain the run of consecutive ready results
            while let Some(result) = self.state.pending.remove(&self.state.next_to_emit) {
                let meta = self.meta_for(&result, total);
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    _ = &mut deadline => Some(Err(None)),
                    r = self.sink.emit(&result, meta) => Some(r.map_err(Some)),
                };
                match sent {
                    None => return self.abort(StreamOutcome::Cancelled).await,
                    Some(Err(None)) => return self.abort(StreamOutcome::TimedOut).await,
                    Some(Err(Some(e))) => return self.transport_failed(e).await,
                    Some(Ok(())) => {}
                }

                if self.first_chunk_latency.is_none() {
                    self.first_chunk_latency = Some(self.started.elapsed());
                }
                if result.is_ok() {
                    self.state.succeeded += 1;
                } else {
                    self.state.failed += 1;
                }
                self.state.next_to_emit += 1;
                self.scheduler.refill(self.state.next_to_emit);
            }
        }

        self.complete().await
    }

    fn meta_for(&self, result: &SynthesisResult, total: usize) -> EmitMeta {
        let ok = result.is_ok();
        EmitMeta {
            chunk_index: ok.then_some(self.state.succeeded),
            total_units: total,
            is_final: ok && result.index + 1 == total,
        }
    }

    async fn complete(mut self) -> StreamReport {
        if let Err(e) = self.sink.emit_complete(self.state.succeeded).await {
            return self.transport_failed(e).await;
        }
        self.state.phase = EmitterPhase::Completed;
        info!(
            units = self.scheduler.total(),
            succeeded = self.state.succeeded,
            failed = self.state.failed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stream complete"
        );
        self.report(StreamOutcome::Completed)
    }

    /// Cancellation or deadline: stop dispatch and discard in-flight work.
    async fn abort(mut self, outcome: StreamOutcome) -> StreamReport {
        self.scheduler.stop();
        self.state.cancelled = true;
        self.state.phase = EmitterPhase::Cancelled;
        self.state.pending.clear();
        info!(
            emitted = self.state.next_to_emit,
            units = self.scheduler.total(),
            ?outcome,
            "stream cancelled"
        );
        if outcome == StreamOutcome::TimedOut {
            // client is still there: tell it why the stream ended
            self.notify_error(DEADLINE_REASON).await;
        }
        self.report(outcome)
    }

    async fn transport_failed(self, e: SinkError) -> StreamReport {
        warn!(error = %e, emitted = self.state.next_to_emit, "transport failed, abandoning stream");
        self.fail(e.to_string(), false).await
    }

    async fn fail(mut self, reason: String, notify: bool) -> StreamReport {
        self.scheduler.stop();
        self.state.phase = EmitterPhase::Failed;
        self.state.pending.clear();
        if notify {
            self.notify_error(&reason).await;
        }
        self.report(StreamOutcome::Failed(reason))
    }

    async fn notify_error(&mut self, reason: &str) {
        match tokio::time::timeout(TERMINAL_NOTICE_TIMEOUT, self.sink.emit_error(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "terminal error event not delivered"),
            Err(_) => debug!("terminal error event timed out"),
        }
    }

    fn report(&self, outcome: StreamOutcome) -> StreamReport {
        debug!(
            phase = ?self.state.phase,
            cancelled = self.state.cancelled,
            in_flight = self.state.in_flight,
            "emitter finished"
        );
        StreamReport {
            outcome,
            total_units: self.scheduler.total(),
            emitted: self.state.next_to_emit,
            succeeded: self.state.succeeded,
            failed: self.state.failed,
            first_chunk_latency: self.first_chunk_latency,
        }
    }
}
