//! Pure backoff arithmetic. Nothing here touches a clock, a store, or an
//! I/O handle — it is a function of `(strategy, base delay, attempt)`.

use crate::job::BackoffStrategy;
use rand::Rng;

/// No scheduled delay — jittered or not — ever exceeds this.
pub const MAX_DELAY_SECS: u64 = 3600;

/// `nextDelay(strategy, baseDelay, attempt)`, clamped to `MAX_DELAY_SECS`.
/// This is the value a human-facing schedule preview should show; it never
/// includes jitter (see [`jittered_delay_secs`]).
pub fn next_delay_secs(strategy: BackoffStrategy, base_delay_secs: u64, attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    let raw = match strategy {
        BackoffStrategy::Exponential => {
            let exponent = (attempt - 1).min(63);
            base_delay_secs.saturating_mul(2u64.saturating_pow(exponent))
        }
        BackoffStrategy::Linear => base_delay_secs.saturating_mul(attempt as u64),
        BackoffStrategy::Fixed => base_delay_secs,
    };
    raw.min(MAX_DELAY_SECS)
}

/// The delay actually applied to a row's `available_at`: `next_delay_secs`
/// perturbed by +/-10% jitter so that many workers restarting at once do
/// not realign on the same retry instant. Uses the OS's CSPRNG rather than
/// a fast non-cryptographic generator, per the jitter-source requirement.
pub fn jittered_delay_secs(strategy: BackoffStrategy, base_delay_secs: u64, attempt: u32) -> u64 {
    apply_jitter(next_delay_secs(strategy, base_delay_secs, attempt))
}

fn apply_jitter(delay_secs: u64) -> u64 {
    let mut rng = rand::rngs::OsRng;
    let factor: f64 = rng.gen_range(0.9..=1.1);
    let jittered = (delay_secs as f64 * factor).round();
    (jittered.max(0.0) as u64).min(MAX_DELAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_attempt() {
        assert_eq!(next_delay_secs(BackoffStrategy::Exponential, 10, 1), 10);
        assert_eq!(next_delay_secs(BackoffStrategy::Exponential, 10, 2), 20);
        assert_eq!(next_delay_secs(BackoffStrategy::Exponential, 10, 3), 40);
    }

    #[test]
    fn linear_scales_with_attempt() {
        assert_eq!(next_delay_secs(BackoffStrategy::Linear, 10, 1), 10);
        assert_eq!(next_delay_secs(BackoffStrategy::Linear, 10, 4), 40);
    }

    #[test]
    fn fixed_ignores_attempt() {
        assert_eq!(next_delay_secs(BackoffStrategy::Fixed, 10, 1), 10);
        assert_eq!(next_delay_secs(BackoffStrategy::Fixed, 10, 9), 10);
    }

    #[test]
    fn clamps_to_max_delay() {
        let delay = next_delay_secs(BackoffStrategy::Exponential, 600, 10);
        assert_eq!(delay, MAX_DELAY_SECS);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for attempt in 1..=5 {
            let base = next_delay_secs(BackoffStrategy::Exponential, 10, attempt) as f64;
            for _ in 0..200 {
                let jittered = jittered_delay_secs(BackoffStrategy::Exponential, 10, attempt) as f64;
                assert!(jittered >= (base * 0.9).floor() - 1.0);
                assert!(jittered <= (base * 1.1).ceil() + 1.0);
            }
        }
    }

    #[test]
    fn backoff_parse_falls_back_to_exponential() {
        assert_eq!(BackoffStrategy::parse("bogus"), BackoffStrategy::Exponential);
        assert_eq!(BackoffStrategy::parse("linear"), BackoffStrategy::Linear);
    }
}
