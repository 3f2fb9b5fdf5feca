//! Statistical properties of the delay generator
//!
//! The unclamped samples must form an exponential distribution: sample
//! mean within 2% of the configured mean over 10k draws and coefficient
//! of variation near 1. Clamped samples must respect the bounds with only
//! the expected clamp tails at the boundaries.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::vrf::poisson_delay::{delay_vrf_input, vrf_poisson_delay, PoissonDelayGenerator};
use crate::vrf::vrf_delay::{vrf_verify, VrfKeyPair};

const SAMPLES: usize = 10_000;

fn generator(mean: u64, min: u64, max: u64) -> PoissonDelayGenerator {
    PoissonDelayGenerator::new(
        Duration::from_millis(mean),
        Duration::from_millis(min),
        Duration::from_millis(max),
    )
    .unwrap()
}

fn entropy_stream(seed: u64) -> impl Iterator<Item = [u8; 8]> {
    let mut rng = StdRng::seed_from_u64(seed);
    std::iter::repeat_with(move || {
        let mut entropy = [0u8; 8];
        rng.fill_bytes(&mut entropy);
        entropy
    })
}

#[test]
fn test_unclamped_mean_within_two_percent() {
    // Extra draws push the standard error of the mean to ~0.5%, keeping
    // the 2% assertion far from the noise floor.
    let draws = SAMPLES * 4;
    let gen = generator(500, 50, 2000);
    let sum: f64 = entropy_stream(11)
        .take(draws)
        .map(|e| gen.unclamped_ms(e))
        .sum();
    let mean = sum / draws as f64;

    assert!(
        (mean - 500.0).abs() / 500.0 < 0.02,
        "sample mean {mean:.2}ms deviates more than 2% from 500ms"
    );
}

#[test]
fn test_unclamped_coefficient_of_variation_near_one() {
    let gen = generator(500, 50, 2000);
    let samples: Vec<f64> = entropy_stream(13)
        .take(SAMPLES)
        .map(|e| gen.unclamped_ms(e))
        .collect();

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    let cv = variance.sqrt() / mean;

    assert!(
        (cv - 1.0).abs() < 0.1,
        "coefficient of variation {cv:.3} is not exponential-like"
    );
}

#[test]
fn test_clamped_samples_stay_in_bounds() {
    let gen = generator(500, 50, 2000);
    for entropy in entropy_stream(17).take(SAMPLES) {
        let delay = gen.next_delay(entropy);
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(2000));
    }
}

#[test]
fn test_clamp_tail_is_thin_near_boundaries() {
    // Samples that clamp land exactly on the boundary; samples landing
    // naturally within 1ms of either boundary must stay rare (the
    // exponential density there is ~0.2% per millisecond).
    let gen = generator(500, 50, 2000);
    let min = Duration::from_millis(50);
    let max = Duration::from_millis(2000);

    let mut near_boundary = 0usize;
    for entropy in entropy_stream(19).take(SAMPLES) {
        let delay = gen.next_delay(entropy);
        let near_min = delay > min && delay < min + Duration::from_millis(1);
        let near_max = delay > max - Duration::from_millis(1) && delay < max;
        if near_min || near_max {
            near_boundary += 1;
        }
    }
    assert!(
        (near_boundary as f64) / (SAMPLES as f64) <= 0.005,
        "{near_boundary} of {SAMPLES} samples hug the clamp boundaries"
    );
}

#[test]
fn test_clamped_mean_matches_expectation() {
    // E[clamp(X, 50, 2000)] for X ~ Exp(mean 500) is about 493ms.
    let gen = generator(500, 50, 2000);
    let sum: f64 = entropy_stream(23)
        .take(SAMPLES)
        .map(|e| gen.next_delay(e).as_secs_f64() * 1000.0)
        .sum();
    let mean = sum / SAMPLES as f64;
    assert!(
        (490.0..=510.0).contains(&mean),
        "clamped mean {mean:.2}ms deviates from expectation"
    );
}

#[test]
fn test_vrf_seeded_draws_are_deterministic_and_auditable() {
    let vrf = VrfKeyPair::from_seed(&[21u8; 32]).unwrap();
    let gen = generator(500, 50, 2000);

    let mut rng = StdRng::seed_from_u64(29);
    for _ in 0..100 {
        let mut tag = [0u8; 16];
        rng.fill_bytes(&mut tag);

        let (delay_a, eval_a) = vrf_poisson_delay(&vrf, &gen, &tag);
        let (delay_b, _) = vrf_poisson_delay(&vrf, &gen, &tag);
        assert_eq!(delay_a, delay_b, "VRF delay must be deterministic per tag");

        // The audit path reproduces the exact dwell obligation.
        let output = vrf_verify(
            &vrf.public_key(),
            &delay_vrf_input(&tag),
            &eval_a.preout,
            &eval_a.proof,
        )
        .unwrap();
        let mut entropy = [0u8; 8];
        entropy.copy_from_slice(&output[..8]);
        assert_eq!(gen.next_delay(entropy), delay_a);
    }
}

#[test]
fn test_distinct_tags_spread_delays() {
    // Different packets draw visibly different dwell times; a constant
    // output would defeat the mixing.
    let vrf = VrfKeyPair::from_seed(&[27u8; 32]).unwrap();
    let gen = generator(500, 50, 2000);

    let mut delays = std::collections::HashSet::new();
    for i in 0..64u8 {
        let (delay, _) = vrf_poisson_delay(&vrf, &gen, &[i; 16]);
        delays.insert(delay.as_micros());
    }
    assert!(delays.len() > 32, "only {} distinct delays", delays.len());
}
