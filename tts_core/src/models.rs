//! Loaded voice models keyed by config path, with least-recently-used
//! eviction. Concurrent misses on the same key share a single load.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use dashmap::DashMap;
use tracing::debug;

struct Loaded<T> {
    model: Arc<T>,
    sample_rate: u32,
    last_accessed: Instant,
}

pub struct ModelCache<T> {
    entries: DashMap<String, Loaded<T>>,
    // one gate per key, held for the duration of a load
    gates: DashMap<String, Arc<Mutex<()>>>,
    capacity: usize,
}

// Manual Debug implementation since the model types don't implement Debug
impl<T> std::fmt::Debug for ModelCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("loaded", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> ModelCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            gates: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn lookup(&self, key: &str) -> Option<(Arc<T>, u32)> {
        let mut entry = self.entries.get_mut(key)?;
        entry.last_accessed = Instant::now();
        Some((entry.model.clone(), entry.sample_rate))
    }

    /// Return the cached model for `key`, running `load` on a miss. Callers
    /// racing on the same missing key wait for the first load instead of
    /// starting their own. Failed loads are not cached.
    pub fn get_or_load<F>(&self, key: &str, load: F) -> anyhow::Result<(Arc<T>, u32)>
    where
        F: FnOnce() -> anyhow::Result<(T, u32)>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let gate = self.gates.entry(key.to_string()).or_default().clone();
        // a panicking loader leaves nothing behind worth protecting
        let _loading = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let (model, sample_rate) = load()?;
        let model = Arc::new(model);
        self.evict_to_fit();
        self.entries.insert(
            key.to_string(),
            Loaded {
                model: model.clone(),
                sample_rate,
                last_accessed: Instant::now(),
            },
        );
        Ok((model, sample_rate))
    }

    fn evict_to_fit(&self) {
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.last_accessed)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else { break };
            debug!(config = %key, "evicting least recently used voice model");
            self.entries.remove(&key);
        }
    }
}
