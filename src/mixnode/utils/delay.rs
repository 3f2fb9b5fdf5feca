//! Delay scheduler
//!
//! A stable min-priority queue keyed on `(release_time, sequence)`. Workers
//! push delay tasks; the single egress dispatcher parks on the earliest
//! deadline and is woken early when a push moves the minimum. Tasks with
//! equal release times drain in FIFO push order, and nothing is handed out
//! before its release time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

struct Entry<T> {
    release_at: Instant,
    seq: u64,
    task: T,
}

// Max-heap inverted into a min-heap on (release_at, seq).
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.release_at, other.seq).cmp(&(self.release_at, self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

/// Shared delay scheduler. Push is O(log n); draining returns released
/// tasks in ascending release order.
pub struct DelayScheduler<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    seq: AtomicU64,
    len: AtomicUsize,
    notify: Notify,
}

impl<T> DelayScheduler<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Schedule a task. Wakes the dispatcher if this becomes the new
    /// earliest deadline.
    pub fn push(&self, release_at: Instant, task: T) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let became_min = {
            let mut heap = self.heap.lock().expect("scheduler lock poisoned");
            let became_min = heap
                .peek()
                .map(|min| release_at < min.release_at)
                .unwrap_or(true);
            heap.push(Entry {
                release_at,
                seq,
                task,
            });
            became_min
        };
        self.len.fetch_add(1, Ordering::Relaxed);
        if became_min {
            self.notify.notify_one();
        }
    }

    /// All tasks due at `now`, ascending by (release_time, push order).
    pub fn drain_ready(&self, now: Instant) -> Vec<T> {
        let mut heap = self.heap.lock().expect("scheduler lock poisoned");
        let mut ready = Vec::new();
        while let Some(min) = heap.peek() {
            if min.release_at > now {
                break;
            }
            ready.push(heap.pop().expect("peeked entry present").task);
        }
        self.len.fetch_sub(ready.len(), Ordering::Relaxed);
        ready
    }

    /// Remove everything; used at shutdown to split the backlog into
    /// flushable and droppable tasks.
    pub fn drain_all(&self) -> Vec<(Instant, T)> {
        let mut heap = self.heap.lock().expect("scheduler lock poisoned");
        let mut all: Vec<(Instant, T)> = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            all.push((entry.release_at, entry.task));
        }
        self.len.store(0, Ordering::Relaxed);
        all
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let heap = self.heap.lock().expect("scheduler lock poisoned");
        heap.peek().map(|min| min.release_at)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park until the earliest deadline passes or a push rearms the
    /// timer. Returns without guarantee of readiness; callers loop around
    /// `drain_ready`.
    pub async fn wait(&self) {
        match self.next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    _ = self.notify.notified() => {}
                }
            }
            None => self.notify.notified().await,
        }
    }

    /// Wake any parked dispatcher (used to propagate shutdown).
    pub fn kick(&self) {
        self.notify.notify_one();
    }
}

impl<T> Default for DelayScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
