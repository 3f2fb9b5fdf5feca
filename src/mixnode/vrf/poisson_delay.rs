//! Poisson-distributed per-packet delays
//!
//! Dwell times follow an exponential distribution (the inter-arrival law
//! of a Poisson process) so an observer correlating arrival and departure
//! times gains nothing. Sampling is by inverse transform over an explicit
//! 8-byte entropy input, which lets the VRF seed it deterministically:
//! given the proof, an auditor can recompute the exact delay a relay was
//! obliged to apply.
//!
//! # Mathematical Background
//!
//! For `u` uniform on (0,1], `-mean * ln(u)` is exponentially distributed
//! with rate `1/mean`. Samples are clamped to `[min, max]`:
//! - **min** prevents near-zero dwell times that leak ordering
//! - **max** bounds worst-case latency
//!
//! Mean, min and max are hot-reloadable; the clamp is applied after
//! sampling so the unclamped distribution stays exponential (tests assert
//! sample mean within ±2% and coefficient of variation ≈ 1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::RngCore;

use crate::crypto::crypto::TAG_LEN;
use crate::vrf::vrf_delay::{VrfEvaluation, VrfKeyPair};
use crate::{MixnodeError, Result};

/// Domain separation for delay-seeding VRF inputs.
const DELAY_INPUT_PREFIX: &[u8] = b"delay:";

/// Exponential delay sampler with hot-reloadable parameters.
pub struct PoissonDelayGenerator {
    mean_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl PoissonDelayGenerator {
    /// Create a generator; `min <= mean <= max` and `mean > 0`.
    pub fn new(mean: Duration, min: Duration, max: Duration) -> Result<Self> {
        Self::validate(mean, min, max)?;
        Ok(Self {
            mean_ms: AtomicU64::new(mean.as_millis() as u64),
            min_ms: AtomicU64::new(min.as_millis() as u64),
            max_ms: AtomicU64::new(max.as_millis() as u64),
        })
    }

    fn validate(mean: Duration, min: Duration, max: Duration) -> Result<()> {
        if mean.is_zero() {
            return Err(MixnodeError::Config(
                "mean delay must be positive".to_string(),
            ));
        }
        if mean < min || mean > max {
            return Err(MixnodeError::Config(
                "mean delay must be between min and max delays".to_string(),
            ));
        }
        Ok(())
    }

    /// Swap in new parameters; rejected atomically on invalid combinations.
    pub fn reload(&self, mean: Duration, min: Duration, max: Duration) -> Result<()> {
        Self::validate(mean, min, max)?;
        self.mean_ms
            .store(mean.as_millis() as u64, Ordering::Relaxed);
        self.min_ms.store(min.as_millis() as u64, Ordering::Relaxed);
        self.max_ms.store(max.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.mean_ms.load(Ordering::Relaxed))
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.load(Ordering::Relaxed))
    }

    /// Inverse-CDF sample before clamping, in milliseconds. Entropy maps
    /// to `u` on (0,1], so `u = 1` (all-ones entropy inverted) yields zero
    /// and nothing can produce infinity.
    pub fn unclamped_ms(&self, entropy: [u8; 8]) -> f64 {
        let mean_ms = self.mean_ms.load(Ordering::Relaxed) as f64;
        let x = u64::from_be_bytes(entropy);
        let u = (x as f64 + 1.0) / (u64::MAX as f64 + 1.0);
        -mean_ms * u.ln()
    }

    /// The next delay for the given entropy, clamped to `[min, max]`.
    pub fn next_delay(&self, entropy: [u8; 8]) -> Duration {
        let raw = self.unclamped_ms(entropy);
        let min = self.min_ms.load(Ordering::Relaxed) as f64;
        let max = self.max_ms.load(Ordering::Relaxed) as f64;
        Duration::from_micros((raw.clamp(min, max) * 1000.0) as u64)
    }

    /// Sample with OS entropy. Cover traffic and tests; real packets are
    /// VRF-seeded via [`vrf_poisson_delay`].
    pub fn next_delay_os(&self) -> Duration {
        let mut entropy = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        self.next_delay(entropy)
    }
}

/// VRF-seeded delay for one packet: deterministic in the node key and the
/// packet's replay tag, so the relay cannot hand-pick dwell times, and the
/// returned evaluation lets an auditor recompute the draw.
pub fn vrf_poisson_delay(
    vrf: &VrfKeyPair,
    generator: &PoissonDelayGenerator,
    packet_tag: &[u8; TAG_LEN],
) -> (Duration, VrfEvaluation) {
    let mut input = [0u8; DELAY_INPUT_PREFIX.len() + TAG_LEN];
    input[..DELAY_INPUT_PREFIX.len()].copy_from_slice(DELAY_INPUT_PREFIX);
    input[DELAY_INPUT_PREFIX.len()..].copy_from_slice(packet_tag);

    let eval = vrf.eval(&input);
    let mut entropy = [0u8; 8];
    entropy.copy_from_slice(&eval.output[..8]);
    (generator.next_delay(entropy), eval)
}

/// Recompute the delay input an auditor feeds to
/// [`vrf_verify`](crate::vrf::vrf_delay::vrf_verify) for a given packet
/// tag.
pub fn delay_vrf_input(packet_tag: &[u8; TAG_LEN]) -> Vec<u8> {
    let mut input = Vec::with_capacity(DELAY_INPUT_PREFIX.len() + TAG_LEN);
    input.extend_from_slice(DELAY_INPUT_PREFIX);
    input.extend_from_slice(packet_tag);
    input
}
