//! Batched ingress queue
//!
//! Bounded FIFO between the transport acceptor and the worker set. Workers
//! drain up to the configured batch size per dequeue to amortize wakeups;
//! batch boundaries are internal and carry no ordering meaning, since the
//! delay scheduler alone orders egress. The depth limit is hot-reloadable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Queue statistics kept alongside the pipeline counters.
#[derive(Debug, Default)]
pub struct BatchingStats {
    pub packets_queued: AtomicU64,
    pub batches_drained: AtomicU64,
}

impl BatchingStats {
    /// Mean packets per drained batch.
    pub fn average_batch_size(&self) -> f64 {
        let batches = self.batches_drained.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.packets_queued.load(Ordering::Relaxed) as f64 / batches as f64
    }
}

/// Bounded multi-producer queue with batch consumption.
pub struct BatchQueue<T> {
    inner: Mutex<VecDeque<T>>,
    limit: AtomicUsize,
    notify: Notify,
    stats: BatchingStats,
}

impl<T> BatchQueue<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(limit.min(4096))),
            limit: AtomicUsize::new(limit),
            notify: Notify::new(),
            stats: BatchingStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn stats(&self) -> &BatchingStats {
        &self.stats
    }

    /// Enqueue, or hand the item back when the queue is at depth.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut queue = self.inner.lock().expect("queue lock poisoned");
            if queue.len() >= self.limit.load(Ordering::Relaxed) {
                return Err(item);
            }
            queue.push_back(item);
        }
        self.stats.packets_queued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Drain up to `max` items without waiting.
    pub fn try_pop_batch(&self, max: usize) -> Vec<T> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        let take = queue.len().min(max);
        if take == 0 {
            return Vec::new();
        }
        self.stats.batches_drained.fetch_add(1, Ordering::Relaxed);
        queue.drain(..take).collect()
    }

    /// Wait until at least one item is available, then drain up to `max`.
    /// A spurious empty return is possible when several workers race one
    /// notification; callers simply loop.
    pub async fn pop_batch(&self, max: usize) -> Vec<T> {
        loop {
            let batch = self.try_pop_batch(max);
            if !batch.is_empty() {
                // Another producer may have pushed while we drained.
                self.notify.notify_one();
                return batch;
            }
            self.notify.notified().await;
        }
    }

    /// Wake one parked consumer without enqueuing (shutdown path).
    pub fn kick(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_push_respects_depth_limit() {
        let queue = BatchQueue::new(3);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.push(4), Err(4));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_batch_drain_caps_at_max() {
        let queue = BatchQueue::new(100);
        for i in 0..50 {
            queue.push(i).unwrap();
        }
        let batch = queue.try_pop_batch(16);
        assert_eq!(batch.len(), 16);
        assert_eq!(batch[0], 0);
        assert_eq!(queue.len(), 34);
    }

    #[test]
    fn test_fifo_order_across_batches() {
        let queue = BatchQueue::new(100);
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        let first = queue.try_pop_batch(4);
        let second = queue.try_pop_batch(4);
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_limit_reload() {
        let queue = BatchQueue::new(1);
        queue.push(1).unwrap();
        assert!(queue.push(2).is_err());

        queue.set_limit(10);
        assert!(queue.push(2).is_ok());
    }

    #[tokio::test]
    async fn test_pop_batch_wakes_on_push() {
        let queue = Arc::new(BatchQueue::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_batch(8).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert_eq!(batch, vec![42]);
    }

    #[test]
    fn test_average_batch_size() {
        let queue = BatchQueue::new(100);
        for i in 0..8 {
            queue.push(i).unwrap();
        }
        queue.try_pop_batch(4);
        queue.try_pop_batch(4);
        assert!((queue.stats().average_batch_size() - 4.0).abs() < f64::EPSILON);
    }
}
