//! Mixnode metrics
//!
//! Atomic counters and EWMA gauges owned by the node and injected into
//! every component. Snapshots are plain loads into a serializable struct;
//! no lock is ever taken on the hot path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::DropReason;

/// EWMA smoothing factor for latency/throughput gauges.
const EWMA_ALPHA: f64 = 0.1;

/// Process-wide mixnode metrics.
pub struct MixnodeMetrics {
    started: Instant,
    /// Packets accepted into the processor
    packets_processed: AtomicU64,
    /// Packets written to egress
    packets_forwarded: AtomicU64,
    /// Packets terminating at this node
    packets_delivered: AtomicU64,
    /// Replay drops, also counted under drops[replay]
    replays_detected: AtomicU64,
    /// Per-reason drop counters, indexed by DropReason
    drops: [AtomicU64; DropReason::ALL.len()],
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    worker_restarts: AtomicU64,
    shutdown_abandoned: AtomicU64,
    cover_sent: AtomicU64,
    /// EWMA of ingress-to-egress dwell (f64 bits)
    avg_latency_ms: AtomicU64,
    /// EWMA of egress throughput (f64 bits)
    throughput_pps: AtomicU64,
}

impl MixnodeMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            packets_processed: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            packets_delivered: AtomicU64::new(0),
            replays_detected: AtomicU64::new(0),
            drops: Default::default(),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            shutdown_abandoned: AtomicU64::new(0),
            cover_sent: AtomicU64::new(0),
            avg_latency_ms: AtomicU64::new(0f64.to_bits()),
            throughput_pps: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn record_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, dwell: Duration) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        ewma_update(&self.avg_latency_ms, dwell.as_secs_f64() * 1000.0);
    }

    pub fn record_delivered(&self) {
        self.packets_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
        if reason == DropReason::Replay {
            self.replays_detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_pool_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown_abandoned(&self, count: u64) {
        self.shutdown_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cover_sent(&self) {
        self.cover_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Fed by the periodic reporter with the latest measured rate.
    pub fn record_throughput_sample(&self, pps: f64) {
        ewma_update(&self.throughput_pps, pps);
    }

    pub fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    pub fn packets_forwarded(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }

    pub fn packets_delivered(&self) -> u64 {
        self.packets_delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.drops.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Lock-free snapshot of everything.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.pool_hits.load(Ordering::Relaxed);
        let misses = self.pool_misses.load(Ordering::Relaxed);
        let pool_hit_rate = if hits + misses == 0 {
            1.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let mut dropped = BTreeMap::new();
        for reason in DropReason::ALL {
            dropped.insert(
                reason.as_str().to_string(),
                self.drops[reason.index()].load(Ordering::Relaxed),
            );
        }

        MetricsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            replays_detected: self.replays_detected.load(Ordering::Relaxed),
            packets_dropped: dropped,
            pool_hits: hits,
            pool_misses: misses,
            pool_hit_rate,
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            shutdown_abandoned: self.shutdown_abandoned.load(Ordering::Relaxed),
            cover_sent: self.cover_sent.load(Ordering::Relaxed),
            avg_latency_ms: f64::from_bits(self.avg_latency_ms.load(Ordering::Relaxed)),
            throughput_pps: f64::from_bits(self.throughput_pps.load(Ordering::Relaxed)),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for MixnodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn ewma_update(cell: &AtomicU64, sample: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let old = f64::from_bits(current);
        let new = if old == 0.0 {
            sample
        } else {
            EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * old
        };
        match cell.compare_exchange_weak(
            current,
            new.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Point-in-time view served over the admin channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub packets_processed: u64,
    pub packets_forwarded: u64,
    pub packets_delivered: u64,
    pub replays_detected: u64,
    pub packets_dropped: BTreeMap<String, u64>,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_hit_rate: f64,
    pub worker_restarts: u64,
    pub shutdown_abandoned: u64,
    pub cover_sent: u64,
    pub avg_latency_ms: f64,
    pub throughput_pps: f64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = MixnodeMetrics::new();
        m.record_processed();
        m.record_processed();
        m.record_forwarded(Duration::from_millis(120));
        m.record_drop(DropReason::BadMac);
        m.record_drop(DropReason::Replay);

        let snap = m.snapshot();
        assert_eq!(snap.packets_processed, 2);
        assert_eq!(snap.packets_forwarded, 1);
        assert_eq!(snap.packets_dropped["bad_mac"], 1);
        assert_eq!(snap.packets_dropped["replay"], 1);
        assert_eq!(snap.replays_detected, 1);
    }

    #[test]
    fn test_latency_ewma_tracks_samples() {
        let m = MixnodeMetrics::new();
        m.record_forwarded(Duration::from_millis(100));
        assert!((m.snapshot().avg_latency_ms - 100.0).abs() < 1e-9);

        m.record_forwarded(Duration::from_millis(200));
        let after = m.snapshot().avg_latency_ms;
        assert!(after > 100.0 && after < 200.0);
    }

    #[test]
    fn test_pool_hit_rate() {
        let m = MixnodeMetrics::new();
        for _ in 0..9 {
            m.record_pool_hit();
        }
        m.record_pool_miss();
        assert!((m.snapshot().pool_hit_rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_accounting_identity() {
        // processed = forwarded + delivered + dropped when nothing is in
        // flight.
        let m = MixnodeMetrics::new();
        for _ in 0..10 {
            m.record_processed();
        }
        for _ in 0..6 {
            m.record_forwarded(Duration::from_millis(10));
        }
        for _ in 0..2 {
            m.record_delivered();
        }
        m.record_drop(DropReason::Replay);
        m.record_drop(DropReason::CryptoFailure);

        let snap = m.snapshot();
        let dropped: u64 = snap.packets_dropped.values().sum();
        assert_eq!(
            snap.packets_processed,
            snap.packets_forwarded + snap.packets_delivered + dropped
        );
    }
}
