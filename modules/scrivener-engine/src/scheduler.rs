// Retry clock: exponential backoff with jitter, capped.

use std::time::Duration;

use rand::Rng;

use scrivener_common::SchedulerConfig;

/// Delay before the next attempt, given how many attempts have completed.
/// Grows as base * 2^attempts up to the cap, with +/- jitter applied.
pub fn backoff_delay(config: &SchedulerConfig, attempts_completed: i64) -> Duration {
    let base_ms = config.backoff_base.as_millis() as f64;
    let cap_ms = config.backoff_cap.as_millis() as f64;
    let exponent = attempts_completed.clamp(0, 32) as i32;
    let raw = (base_ms * 2f64.powi(exponent)).min(cap_ms);

    let jitter = config.backoff_jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };

    Duration::from_millis((raw * factor).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> SchedulerConfig {
        SchedulerConfig {
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            backoff_jitter: jitter,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn doubles_per_attempt_without_jitter() {
        let config = config(0.0);
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(120));
    }

    #[test]
    fn caps_at_configured_maximum() {
        let config = config(0.0);
        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(3600));
    }

    #[test]
    fn grows_monotonically_up_to_cap() {
        let config = config(0.0);
        let mut last = Duration::ZERO;
        for attempts in 0..12 {
            let delay = backoff_delay(&config, attempts);
            assert!(delay >= last, "delay shrank at attempt {attempts}");
            last = delay;
        }
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = config(0.2);
        for _ in 0..100 {
            let delay = backoff_delay(&config, 1).as_millis() as f64;
            assert!((48_000.0..=72_000.0).contains(&delay), "delay {delay} out of band");
        }
    }
}
