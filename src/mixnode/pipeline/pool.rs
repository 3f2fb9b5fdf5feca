//! Fixed-frame buffer pool
//!
//! A bounded pool of 1200-byte frames backing the whole pipeline. Frames
//! are acquired on ingress and travel inside an RAII handle through the
//! processor, the delay scheduler and egress; dropping the handle anywhere
//! returns the frame, so no error path can leak capacity. Exhaustion
//! applies backpressure on a semaphore for a bounded wait before the
//! caller drops the packet.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::core::metrics::MixnodeMetrics;
use crate::PACKET_SIZE;

struct PoolShared {
    frames: Mutex<Vec<Box<[u8; PACKET_SIZE]>>>,
    permits: Semaphore,
    capacity: usize,
    metrics: Arc<MixnodeMetrics>,
}

/// Shared frame pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(capacity: usize, metrics: Arc<MixnodeMetrics>) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        frames.resize_with(capacity, || Box::new([0u8; PACKET_SIZE]));
        Self {
            shared: Arc::new(PoolShared {
                frames: Mutex::new(frames),
                permits: Semaphore::new(capacity),
                capacity,
                metrics,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Frames not currently held by the pipeline.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Frames currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.capacity - self.available()
    }

    /// Acquire a zeroed frame, waiting up to `timeout` under exhaustion.
    /// `None` means the caller must drop the packet as pool-exhausted.
    pub async fn acquire(&self, timeout: Duration) -> Option<Frame> {
        let permit = match self.shared.permits.try_acquire() {
            Ok(permit) => {
                self.shared.metrics.record_pool_hit();
                permit
            }
            Err(_) => {
                self.shared.metrics.record_pool_miss();
                match tokio::time::timeout(timeout, self.shared.permits.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    _ => return None,
                }
            }
        };
        // The frame travels independently of the permit; capacity is
        // restored when the Frame handle drops.
        permit.forget();

        let buf = self
            .shared
            .frames
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .expect("permit held but freelist empty");
        Some(Frame {
            buf: Some(buf),
            shared: self.shared.clone(),
        })
    }
}

/// RAII handle over one pooled frame.
pub struct Frame {
    buf: Option<Box<[u8; PACKET_SIZE]>>,
    shared: Arc<PoolShared>,
}

impl Frame {
    /// Copy `data` into the frame; shorter input leaves trailing zeros.
    pub fn fill_from(&mut self, data: &[u8]) {
        let buf = self.buf.as_mut().expect("frame present until drop");
        let n = data.len().min(PACKET_SIZE);
        buf[..n].copy_from_slice(&data[..n]);
        buf[n..].fill(0);
    }
}

impl Deref for Frame {
    type Target = [u8; PACKET_SIZE];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("frame present until drop")
    }
}

impl DerefMut for Frame {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("frame present until drop")
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            // Scrub key-dependent plaintext before the frame is reissued.
            buf.fill(0);
            self.shared
                .frames
                .lock()
                .expect("pool lock poisoned")
                .push(buf);
            self.shared.permits.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> BufferPool {
        BufferPool::new(capacity, Arc::new(MixnodeMetrics::new()))
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool(4);
        assert_eq!(pool.available(), 4);

        let frame = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_flight(), 1);

        drop(frame);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = pool(2);
        let _a = pool.acquire(Duration::from_millis(5)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(5)).await.unwrap();

        let start = std::time::Instant::now();
        assert!(pool.acquire(Duration::from_millis(20)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let pool = pool(1);
        let held = pool.acquire(Duration::from_millis(5)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let frame = waiter.await.unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn test_frames_are_zeroed_on_reuse() {
        let pool = pool(1);
        {
            let mut frame = pool.acquire(Duration::from_millis(5)).await.unwrap();
            frame.fill_from(&[0xAAu8; PACKET_SIZE]);
        }
        let frame = pool.acquire(Duration::from_millis(5)).await.unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_hit_miss_accounting() {
        let metrics = Arc::new(MixnodeMetrics::new());
        let pool = BufferPool::new(1, metrics.clone());

        let frame = pool.acquire(Duration::from_millis(1)).await.unwrap();
        let _ = pool.acquire(Duration::from_millis(1)).await;
        drop(frame);

        let snap = metrics.snapshot();
        assert_eq!(snap.pool_hits, 1);
        assert_eq!(snap.pool_misses, 1);
    }
}
