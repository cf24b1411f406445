//! Fixed-size pool of blocking synthesis workers.
//!
//! The pool is a semaphore over `spawn_blocking`: a [`WorkerSlot`] is one
//! worker, held for the whole duration of one backend call. Waiters are
//! served in FIFO order, so streams sharing a pool are never starved.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self::with_counter(size, Arc::new(AtomicUsize::new(0)))
    }

    /// Pool that reports its active calls into a shared counter.
    pub fn with_counter(size: usize, active: Arc<AtomicUsize>) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            active,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Backend calls currently running (including ones whose caller already
    /// gave up on them after a timeout).
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait for a free worker. `None` only if the pool was closed.
    pub async fn acquire(&self) -> Option<WorkerSlot> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Some(WorkerSlot {
            _permit: permit,
            active: self.active.clone(),
        })
    }
}

/// One occupied worker. Released on drop.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl WorkerSlot {
    /// Run `f` on the blocking thread pool. The slot moves into the closure,
    /// so the worker stays occupied until `f` actually returns, even if the
    /// returned handle is dropped.
    pub fn spawn<F, R>(self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let _slot = self;
            f()
        })
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
