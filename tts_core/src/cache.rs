//! LRU cache of synthesized unit audio, keyed by everything that affects the
//! backend output.

use std::{
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use ahash::AHasher;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::{audio::AudioFrame, unit::SynthesisRequest};

#[derive(Clone)]
struct CachedUnit {
    frames: Vec<AudioFrame>,
    cached_at: Instant,
}

pub struct UnitCache {
    entries: Mutex<LruCache<u64, CachedUnit>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl UnitCache {
    /// `None` when `capacity` is zero (caching disabled).
    pub fn new(capacity: usize, ttl: Duration) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn key(req: &SynthesisRequest) -> u64 {
        let mut hasher = AHasher::default();
        req.unit.text.hash(&mut hasher);
        req.voice.hash(&mut hasher);
        req.speed.to_bits().hash(&mut hasher);
        req.normalize.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn get(&self, req: &SynthesisRequest) -> Option<Vec<AudioFrame>> {
        let key = Self::key(req);
        let mut entries = self.entries.lock().await;
        let fresh = match entries.get(&key) {
            Some(hit) if hit.cached_at.elapsed() < self.ttl => Some(hit.frames.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    pub async fn put(&self, req: &SynthesisRequest, frames: &[AudioFrame]) {
        let entry = CachedUnit {
            frames: frames.to_vec(),
            cached_at: Instant::now(),
        };
        self.entries.lock().await.put(Self::key(req), entry);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
