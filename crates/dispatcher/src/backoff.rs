//! Exponential backoff with jitter for transient-failure retries.

use rand::Rng;
use std::time::Duration;

use crate::DispatcherSettings;

/// Delay before retry number `attempt` (1-based): `base * factor^(n-1)`,
/// capped, with symmetric jitter. Never below 100 ms.
pub fn compute_backoff(settings: &DispatcherSettings, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = settings.backoff_base.as_secs_f64() * settings.backoff_factor.powi(exponent as i32);
    let capped = raw.min(settings.backoff_cap.as_secs_f64());

    let jitter_span = capped * settings.backoff_jitter;
    let jittered = if jitter_span > 0.0 {
        let mut rng = rand::thread_rng();
        capped + rng.gen_range(-jitter_span..jitter_span)
    } else {
        capped
    };

    Duration::from_secs_f64(jittered.max(0.1))
}
