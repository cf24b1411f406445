//! Prefetch scheduler: keeps a bounded window of units in flight ahead of
//! the one due for emission.
//!
//! Every index in `[next_to_emit, next_to_emit + window]` is dispatched as
//! soon as the emitter advances; each dispatched task then waits for a free
//! worker. Dispatch walks a single cursor, so an index is never dispatched
//! twice.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    pool::WorkerPool,
    synth::UnitSynthesizer,
    unit::{SynthesisParams, SynthesisRequest, SynthesisResult, SynthesisUnit},
};

pub struct PrefetchScheduler {
    units: Vec<Option<SynthesisUnit>>,
    params: SynthesisParams,
    synth: Arc<UnitSynthesizer>,
    pool: WorkerPool,
    window: usize,
    next_dispatch: usize,
    tasks: JoinSet<Option<SynthesisResult>>,
    stop: CancellationToken,
}

impl PrefetchScheduler {
    pub fn new(
        units: Vec<SynthesisUnit>,
        params: SynthesisParams,
        synth: Arc<UnitSynthesizer>,
        pool: WorkerPool,
        window: usize,
    ) -> Self {
        Self {
            units: units.into_iter().map(Some).collect(),
            params,
            synth,
            pool,
            window,
            next_dispatch: 0,
            tasks: JoinSet::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.units.len()
    }

    /// Number of indices dispatched so far (always a prefix of the units).
    pub fn dispatched(&self) -> usize {
        self.next_dispatch
    }

    /// Dispatched tasks whose result has not been collected yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Dispatch every eligible index. Called once at start and again on each
    /// emission advance. Returns how many were newly dispatched.
    pub fn refill(&mut self, next_to_emit: usize) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let horizon = next_to_emit.saturating_add(self.window);
        let mut launched = 0;
        while self.next_dispatch < self.units.len() && self.next_dispatch <= horizon {
            if let Some(unit) = self.units[self.next_dispatch].take() {
                self.dispatch(unit);
                launched += 1;
            }
            self.next_dispatch += 1;
        }
        launched
    }

    fn dispatch(&mut self, unit: SynthesisUnit) {
        debug!(index = unit.index, "dispatching unit");
        let req = SynthesisRequest::new(unit, &self.params);
        let synth = self.synth.clone();
        let pool = self.pool.clone();
        let stop = self.stop.clone();

        self.tasks.spawn(async move {
            if let Some(hit) = synth.lookup(&req).await {
                debug!(index = req.unit.index, "unit served from cache");
                return Some(hit);
            }
            let slot = tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                slot = pool.acquire() => slot?,
            };
            // stopped while this task was queued for a worker
            if stop.is_cancelled() {
                return None;
            }
            Some(synth.synthesize_unit(req, slot).await)
        });
    }

    /// Next finished result, in completion order. `None` once nothing is
    /// outstanding.
    pub async fn next_completion(&mut self) -> Option<SynthesisResult> {
        loop {
            match self.tasks.join_next().await? {
                Ok(Some(result)) => return Some(result),
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "synthesis task did not complete");
                    continue;
                }
            }
        }
    }

    /// Stop dispatching. Queued tasks give up before touching a worker;
    /// running backend calls finish on their own and their results are
    /// dropped.
    pub fn stop(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.stop.cancel();
        debug!(
            dispatched = self.next_dispatch,
            in_flight = self.tasks.len(),
            "scheduler stopped"
        );
        self.tasks.detach_all();
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
