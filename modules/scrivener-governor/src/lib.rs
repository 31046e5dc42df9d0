// Per-host rate limiting and circuit breaking. One governor per process;
// every outbound fetch goes through acquire/report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use scrivener_common::{GovernorConfig, HostOverride};

/// Answer to an acquire call.
pub enum Acquire {
    /// Budget granted. The permit holds the host's concurrency slot; drop it
    /// when the request finishes.
    Proceed(HostPermit),
    /// Bucket empty or all concurrency slots taken; eligible again at the
    /// given instant.
    WaitUntil(DateTime<Utc>),
    /// Breaker is open; no traffic until the cool-down elapses.
    Blocked { until: DateTime<Utc> },
}

/// Holds one of the host's concurrency slots for the duration of a request.
pub struct HostPermit {
    _permit: OwnedSemaphorePermit,
}

/// What the caller observed, reported back after each request.
#[derive(Debug, Clone, Copy)]
pub enum Observed {
    Success,
    Failure,
    /// Explicit server signal. Spends budget, not breaker credit.
    RateLimited { retry_after: std::time::Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct HostState {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: DateTime<Utc>,
    breaker: BreakerState,
    consecutive_failures: u32,
    /// How many times the breaker has opened without an intervening close.
    open_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    /// Retry-After style embargo, independent of the bucket.
    embargo_until: Option<DateTime<Utc>>,
}

struct HostEntry {
    state: Mutex<HostState>,
    semaphore: Arc<Semaphore>,
}

pub struct Governor {
    config: GovernorConfig,
    hosts: Mutex<HashMap<String, Arc<HostEntry>>>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, host_key: &str, now: DateTime<Utc>) -> Arc<HostEntry> {
        let mut hosts = self.hosts.lock().expect("governor host map poisoned");
        hosts
            .entry(host_key.to_string())
            .or_insert_with(|| {
                let (rate, burst, max_concurrent) = self.limits_for(host_key);
                Arc::new(HostEntry {
                    state: Mutex::new(HostState {
                        tokens: burst as f64,
                        capacity: burst as f64,
                        rate,
                        last_refill: now,
                        breaker: BreakerState::Closed,
                        consecutive_failures: 0,
                        open_count: 0,
                        cooldown_until: None,
                        probe_in_flight: false,
                        embargo_until: None,
                    }),
                    semaphore: Arc::new(Semaphore::new(max_concurrent)),
                })
            })
            .clone()
    }

    fn limits_for(&self, host_key: &str) -> (f64, u32, usize) {
        match self.config.per_host.get(host_key) {
            Some(HostOverride {
                rate,
                burst,
                max_concurrent,
            }) => (*rate, *burst, *max_concurrent),
            None => (
                self.config.default_rate,
                self.config.default_burst,
                self.config.default_max_concurrent,
            ),
        }
    }

    /// Ask for budget to send one request to `host_key`.
    pub fn acquire(&self, host_key: &str, now: DateTime<Utc>) -> Acquire {
        let entry = self.entry(host_key, now);
        let mut state = entry.state.lock().expect("host state poisoned");

        match state.breaker {
            BreakerState::Open => {
                let until = state.cooldown_until.unwrap_or(now);
                if now < until {
                    return Acquire::Blocked { until };
                }
                state.breaker = BreakerState::HalfOpen;
                state.probe_in_flight = false;
                debug!(host = host_key, "breaker half-open, probe allowed");
            }
            BreakerState::HalfOpen | BreakerState::Closed => {}
        }

        if let Some(embargo) = state.embargo_until {
            if now < embargo {
                return Acquire::WaitUntil(embargo);
            }
            state.embargo_until = None;
        }

        if state.breaker == BreakerState::HalfOpen {
            if state.probe_in_flight {
                // One probe at a time; others check back shortly.
                return Acquire::WaitUntil(now + ChronoDuration::seconds(5));
            }
            match entry.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    state.probe_in_flight = true;
                    return Acquire::Proceed(HostPermit { _permit: permit });
                }
                Err(TryAcquireError::NoPermits) => {
                    return Acquire::WaitUntil(now + ChronoDuration::seconds(1));
                }
                Err(TryAcquireError::Closed) => {
                    return Acquire::WaitUntil(now + ChronoDuration::seconds(5));
                }
            }
        }

        refill(&mut state, now);

        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait_secs = if state.rate > 0.0 {
                deficit / state.rate
            } else {
                3600.0
            };
            let wait_ms = (wait_secs * 1000.0).ceil() as i64;
            return Acquire::WaitUntil(now + ChronoDuration::milliseconds(wait_ms.max(1)));
        }

        match entry.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                state.tokens -= 1.0;
                Acquire::Proceed(HostPermit { _permit: permit })
            }
            // All slots in flight; a slot frees within one request's lifetime.
            Err(_) => Acquire::WaitUntil(now + ChronoDuration::seconds(1)),
        }
    }

    /// Earliest instant budget for this host could be granted, or None if an
    /// acquire right now would proceed. Does not consume anything.
    pub fn next_available(&self, host_key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entry = self.entry(host_key, now);
        let mut state = entry.state.lock().expect("host state poisoned");

        if state.breaker == BreakerState::Open {
            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Some(until);
                }
            }
        }
        if let Some(embargo) = state.embargo_until {
            if now < embargo {
                return Some(embargo);
            }
        }

        refill(&mut state, now);
        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait_secs = if state.rate > 0.0 {
                deficit / state.rate
            } else {
                3600.0
            };
            return Some(now + ChronoDuration::milliseconds((wait_secs * 1000.0).ceil() as i64));
        }
        None
    }

    /// Report the outcome of a request previously granted by acquire.
    pub fn report(&self, host_key: &str, observed: Observed, now: DateTime<Utc>) {
        let entry = self.entry(host_key, now);
        let mut state = entry.state.lock().expect("host state poisoned");

        match observed {
            Observed::Success => {
                state.consecutive_failures = 0;
                if state.breaker != BreakerState::Closed {
                    info!(host = host_key, "breaker closed after successful probe");
                }
                state.breaker = BreakerState::Closed;
                state.open_count = 0;
                state.probe_in_flight = false;
                state.cooldown_until = None;
            }
            Observed::Failure => {
                state.consecutive_failures += 1;
                match state.breaker {
                    BreakerState::HalfOpen => {
                        open_breaker(&mut state, host_key, now, &self.config);
                    }
                    BreakerState::Closed
                        if state.consecutive_failures >= self.config.breaker.threshold =>
                    {
                        open_breaker(&mut state, host_key, now, &self.config);
                    }
                    _ => {}
                }
            }
            Observed::RateLimited { retry_after } => {
                state.tokens = 0.0;
                state.last_refill = now;
                state.probe_in_flight = false;
                let until = now
                    + ChronoDuration::milliseconds(retry_after.as_millis().min(i64::MAX as u128)
                        as i64);
                state.embargo_until = Some(state.embargo_until.map_or(until, |e| e.max(until)));
                debug!(host = host_key, retry_after_ms = retry_after.as_millis() as u64,
                    "host embargoed by server signal");
            }
        }
    }
}

fn refill(state: &mut HostState, now: DateTime<Utc>) {
    let elapsed_ms = (now - state.last_refill).num_milliseconds();
    if elapsed_ms <= 0 {
        return;
    }
    state.tokens =
        (state.tokens + state.rate * elapsed_ms as f64 / 1000.0).min(state.capacity);
    state.last_refill = now;
}

fn open_breaker(state: &mut HostState, host_key: &str, now: DateTime<Utc>, config: &GovernorConfig) {
    state.open_count += 1;
    state.breaker = BreakerState::Open;
    state.probe_in_flight = false;

    let base_ms = config.breaker.cooldown_base.as_millis() as f64;
    let cap_ms = config.breaker.cooldown_cap.as_millis() as f64;
    let doubled = base_ms * 2f64.powi(state.open_count.saturating_sub(1).min(16) as i32);
    let jitter = rand::rng().random_range(0.85..1.15);
    let cooldown_ms = (doubled.min(cap_ms) * jitter) as i64;

    state.cooldown_until = Some(now + ChronoDuration::milliseconds(cooldown_ms));
    warn!(
        host = host_key,
        open_count = state.open_count,
        cooldown_ms,
        "breaker opened"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn governor(rate: f64, burst: u32) -> Governor {
        let mut config = GovernorConfig::default();
        config.default_rate = rate;
        config.default_burst = burst;
        config.default_max_concurrent = 8;
        Governor::new(config)
    }

    fn proceed(g: &Governor, host: &str, now: DateTime<Utc>) -> Option<HostPermit> {
        match g.acquire(host, now) {
            Acquire::Proceed(p) => Some(p),
            _ => None,
        }
    }

    #[test]
    fn burst_then_wait() {
        let g = governor(2.0, 4);
        let now = Utc::now();

        for _ in 0..4 {
            assert!(proceed(&g, "example.com", now).is_some());
        }
        match g.acquire("example.com", now) {
            Acquire::WaitUntil(t) => assert!(t > now),
            _ => panic!("expected WaitUntil after burst exhausted"),
        }
    }

    #[test]
    fn bucket_refills_over_time() {
        let g = governor(2.0, 4);
        let now = Utc::now();
        for _ in 0..4 {
            assert!(proceed(&g, "example.com", now).is_some());
        }
        // 1 second at 2 tokens/s refills 2 tokens.
        let later = now + ChronoDuration::seconds(1);
        assert!(proceed(&g, "example.com", later).is_some());
        assert!(proceed(&g, "example.com", later).is_some());
        assert!(proceed(&g, "example.com", later).is_none());
    }

    #[test]
    fn rolling_window_bound_holds() {
        // capacity + rate * W is the hard ceiling on grants in any window W.
        let g = governor(2.0, 4);
        let start = Utc::now();
        let mut granted = 0u32;
        for ms in (0..10_000).step_by(50) {
            let now = start + ChronoDuration::milliseconds(ms);
            if proceed(&g, "example.com", now).is_some() {
                granted += 1;
            }
        }
        assert!(granted <= 4 + 2 * 10, "granted {granted} > cap");
    }

    #[test]
    fn hosts_are_independent() {
        let g = governor(1.0, 1);
        let now = Utc::now();
        assert!(proceed(&g, "a.test", now).is_some());
        assert!(proceed(&g, "b.test", now).is_some());
        assert!(proceed(&g, "a.test", now).is_none());
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let g = governor(100.0, 100);
        let now = Utc::now();
        for _ in 0..5 {
            g.report("bad.test", Observed::Failure, now);
        }
        match g.acquire("bad.test", now) {
            Acquire::Blocked { until } => assert!(until > now),
            _ => panic!("expected Blocked after threshold failures"),
        }
    }

    #[test]
    fn breaker_half_open_probe_then_close() {
        let g = governor(100.0, 100);
        let now = Utc::now();
        for _ in 0..5 {
            g.report("flaky.test", Observed::Failure, now);
        }

        // Past the maximum jittered base cool-down.
        let later = now + ChronoDuration::seconds(90);
        let permit = proceed(&g, "flaky.test", later);
        assert!(permit.is_some(), "half-open should allow one probe");

        // Second caller during the probe waits.
        match g.acquire("flaky.test", later) {
            Acquire::WaitUntil(_) => {}
            _ => panic!("expected WaitUntil while probe in flight"),
        }

        g.report("flaky.test", Observed::Success, later);
        assert!(proceed(&g, "flaky.test", later).is_some());
    }

    #[test]
    fn breaker_reopens_with_longer_cooldown() {
        let g = governor(100.0, 100);
        let now = Utc::now();
        for _ in 0..5 {
            g.report("down.test", Observed::Failure, now);
        }
        let first_until = match g.acquire("down.test", now) {
            Acquire::Blocked { until } => until,
            _ => panic!("expected Blocked"),
        };

        // Probe fails: reopen, cool-down doubles.
        let probe_at = now + ChronoDuration::seconds(90);
        assert!(proceed(&g, "down.test", probe_at).is_some());
        g.report("down.test", Observed::Failure, probe_at);
        let second_until = match g.acquire("down.test", probe_at) {
            Acquire::Blocked { until } => until,
            _ => panic!("expected Blocked after failed probe"),
        };
        let first_span = first_until - now;
        let second_span = second_until - probe_at;
        assert!(
            second_span > first_span,
            "cool-down should grow: {first_span} vs {second_span}"
        );
    }

    #[test]
    fn rate_limited_sets_embargo_without_breaker() {
        let g = governor(100.0, 100);
        let now = Utc::now();
        g.report(
            "busy.test",
            Observed::RateLimited {
                retry_after: Duration::from_secs(30),
            },
            now,
        );
        match g.acquire("busy.test", now) {
            Acquire::WaitUntil(t) => {
                assert!(t >= now + ChronoDuration::seconds(30));
            }
            _ => panic!("expected WaitUntil during embargo"),
        }
        // Embargo expires; breaker never opened.
        let later = now + ChronoDuration::seconds(31);
        assert!(proceed(&g, "busy.test", later).is_some());
    }

    #[test]
    fn next_available_reports_wait_without_consuming() {
        let g = governor(1.0, 1);
        let now = Utc::now();
        assert!(g.next_available("peek.test", now).is_none());
        assert!(proceed(&g, "peek.test", now).is_some());
        let eta = g.next_available("peek.test", now);
        assert!(eta.is_some_and(|t| t > now));
    }

    #[test]
    fn concurrency_slots_are_capped() {
        let mut config = GovernorConfig::default();
        config.default_rate = 100.0;
        config.default_burst = 100;
        config.default_max_concurrent = 2;
        let g = Governor::new(config);
        let now = Utc::now();

        let p1 = proceed(&g, "slots.test", now);
        let p2 = proceed(&g, "slots.test", now);
        assert!(p1.is_some() && p2.is_some());
        assert!(proceed(&g, "slots.test", now).is_none());

        drop(p1);
        assert!(proceed(&g, "slots.test", now).is_some());
    }
}
