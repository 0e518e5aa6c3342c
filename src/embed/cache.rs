//! Caching decorator over any [`Embedder`].
//!
//! Keys are xxh64 fingerprints of the whitespace-normalized text plus the
//! model identifier. The cache is sharded (fine-grained locking under
//! concurrent readers) and approximately LRU per shard. Concurrent misses
//! of the same key coalesce: one caller computes, the rest wait on a
//! per-key gate and find the entry on re-check.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use super::{EmbedError, Embedder};

const SHARDS: usize = 16;

pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    shards: Vec<Mutex<LruCache<u64, Arc<Vec<f32>>>>>,
    inflight: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        let per_shard = (capacity / SHARDS).max(1);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn fingerprint(&self, text: &str) -> u64 {
        let normalized = normalize(text);
        let keyed = format!("{}\u{1}{}", self.inner.model(), normalized);
        xxh64(keyed.as_bytes(), 0)
    }

    fn lookup(&self, key: u64) -> Option<Arc<Vec<f32>>> {
        let shard = &self.shards[(key as usize) % SHARDS];
        shard.lock().get(&key).cloned()
    }

    fn store(&self, key: u64, vector: Arc<Vec<f32>>) {
        let shard = &self.shards[(key as usize) % SHARDS];
        shard.lock().put(key, vector);
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let key = self.fingerprint(text);
        if let Some(vector) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((*vector).clone());
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = gate.lock().await;

        // A coalesced peer may have filled the entry while we waited.
        if let Some(vector) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((*vector).clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.embed(text).await;
        if let Ok(vector) = &result {
            self.store(key, Arc::new(vector.clone()));
        }
        self.inflight.lock().remove(&key);
        result
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
