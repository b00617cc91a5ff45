//! Reconnect backoff
//!
//! `min(initial * multiplier^attempt, max)`, then scaled by a uniform factor in
//! `[1 - jitter, 1 + jitter]`.

use crate::config::ReconnectSection;
use rand::Rng;
use std::time::Duration;

/// Backoff before jitter for zero-based `attempt`
pub fn base_delay(config: &ReconnectSection, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = if scaled.is_finite() {
        scaled.min(config.max_delay_ms as f64)
    } else {
        config.max_delay_ms as f64
    };
    Duration::from_millis(capped as u64)
}

/// Backoff with jitter applied
pub fn jittered_delay<R: Rng>(
    config: &ReconnectSection,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let base = base_delay(config, attempt);
    if config.jitter <= 0.0 {
        return base;
    }
    let factor = rng.gen_range(1.0 - config.jitter..=1.0 + config.jitter);
    base.mul_f64(factor.max(0.0))
}
