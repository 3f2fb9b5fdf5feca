//! Token-bucket rate limiter
//!
//! Gates egress at the configured packet rate. Tokens regenerate
//! continuously from the elapsed clock; the bucket holds a 100 ms burst so
//! scheduler wake-ups draining several due packets at once are not
//! penalized. The refill rate is hot-reloadable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_pps: AtomicU64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_pps: u64) -> Self {
        Self {
            rate_pps: AtomicU64::new(rate_pps.max(1)),
            state: Mutex::new(BucketState {
                tokens: Self::burst_capacity(rate_pps),
                last_refill: Instant::now(),
            }),
        }
    }

    fn burst_capacity(rate_pps: u64) -> f64 {
        (rate_pps as f64 / 10.0).max(1.0)
    }

    pub fn rate(&self) -> u64 {
        self.rate_pps.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, rate_pps: u64) {
        self.rate_pps.store(rate_pps.max(1), Ordering::Relaxed);
    }

    fn refill(&self, state: &mut BucketState) {
        let rate = self.rate_pps.load(Ordering::Relaxed) as f64;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(Self::burst_capacity(rate as u64));
        state.last_refill = now;
    }

    /// Take one token if available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting at most `timeout` for regeneration.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                let rate = self.rate_pps.load(Ordering::Relaxed) as f64;
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(wait.min(deadline - now)).await;
        }
    }
}
