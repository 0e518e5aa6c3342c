//! Queue of node ids awaiting (re-)embedding.
//!
//! Writers push ids whose text-bearing properties changed; the single
//! worker drains batches. Wakes are idempotent notifications, so a trigger
//! while the worker runs is a no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::Notify;

use crate::model::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStatus {
    Disabled,
    Idle,
    Processing,
}

/// Queue counters returned by `/embed/stats` and `/embed/trigger`.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedStats {
    pub status: EmbedStatus,
    pub queued: usize,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<NodeId>,
    members: FxHashSet<NodeId>,
}

pub struct EmbedQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    status: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl EmbedQueue {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            status: AtomicU8::new(if enabled { 1 } else { 0 }),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> EmbedStatus {
        match self.status.load(Ordering::Relaxed) {
            0 => EmbedStatus::Disabled,
            2 => EmbedStatus::Processing,
            _ => EmbedStatus::Idle,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status.load(Ordering::Relaxed) != 0
    }

    pub fn disable(&self) {
        self.status.store(0, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        if self.status.load(Ordering::Relaxed) == 0 {
            self.status.store(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn mark_processing(&self, processing: bool) {
        if self.is_enabled() {
            self.status
                .store(if processing { 2 } else { 1 }, Ordering::Relaxed);
        }
    }

    /// Enqueues ids, deduplicating against entries already waiting, and
    /// wakes the worker.
    pub fn push(&self, ids: &[NodeId]) {
        if !self.is_enabled() || ids.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for id in ids {
                if inner.members.insert(id.clone()) {
                    inner.queue.push_back(id.clone());
                }
            }
        }
        self.notify.notify_one();
    }

    /// Idempotent wake signal for the worker.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Pulls up to `max` ids for one worker batch.
    pub fn pull_batch(&self, max: usize) -> Vec<NodeId> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.queue.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(id) = inner.queue.pop_front() {
                inner.members.remove(&id);
                batch.push(id);
            }
        }
        batch
    }

    pub fn record_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EmbedStats {
        EmbedStats {
            status: self.status(),
            queued: self.inner.lock().queue.len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_deduplicate_waiting_ids() {
        let queue = EmbedQueue::new(true);
        queue.push(&["a".into(), "b".into()]);
        queue.push(&["a".into(), "c".into()]);
        assert_eq!(queue.stats().queued, 3);
        let batch = queue.pull_batch(10);
        assert_eq!(batch, vec!["a".to_string(), "b".into(), "c".into()]);
    }

    #[test]
    fn disabled_queue_rejects_pushes() {
        let queue = EmbedQueue::new(false);
        queue.push(&["a".into()]);
        assert_eq!(queue.stats().queued, 0);
        assert_eq!(queue.status(), EmbedStatus::Disabled);
    }

    #[test]
    fn batches_are_bounded() {
        let queue = EmbedQueue::new(true);
        queue.push(&(0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        assert_eq!(queue.pull_batch(4).len(), 4);
        assert_eq!(queue.stats().queued, 6);
    }
}
