//! Per-token leaky-bucket rate accounting.
//!
//! Enforcement is observational by default: [`RateLimiter::check`] reports
//! whether a token is currently over its allowance, but the connection
//! handler only counts and logs it, it never rejects the request. This
//! mirrors the upstream behavior of tracking abusive clients without
//! actually dropping their traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// One token's allowance state: a classic token bucket, refilled at
/// `max_rps` tokens/second, capped at `max_rps`, costing one token per
/// request.
struct RateCounter {
    allowance: f64,
    last_check: Instant,
}

impl RateCounter {
    fn new(max_rps: f64) -> Self {
        Self {
            allowance: max_rps,
            last_check: Instant::now(),
        }
    }

    fn time_passed(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.last_check).as_secs_f64()
    }
}

pub struct RateLimiter {
    max_rps: f64,
    counters: DashMap<String, Mutex<RateCounter>>,
    limited_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_rps: f64) -> Self {
        Self {
            max_rps,
            counters: DashMap::new(),
            limited_total: AtomicU64::new(0),
        }
    }

    /// Charges one request against `token`'s bucket and returns `true` if
    /// the token is currently over its rate allowance.
    pub fn check(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }

        let now = Instant::now();
        let entry = self
            .counters
            .entry(token.to_string())
            .or_insert_with(|| Mutex::new(RateCounter::new(self.max_rps)));
        let mut counter = entry.lock();

        let time_passed = counter.time_passed(now);
        counter.last_check = now;
        counter.allowance += time_passed * self.max_rps;
        if counter.allowance > self.max_rps {
            counter.allowance = self.max_rps;
        }

        if counter.allowance < 1.0 {
            self.limited_total.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            counter.allowance -= 1.0;
            false
        }
    }

    pub fn limited_total(&self) -> u64 {
        self.limited_total.load(Ordering::Relaxed)
    }

    /// Drops any token whose bucket hasn't been touched in over `idle_for`.
    /// Intended to be called periodically from a maintenance task.
    pub fn garbage_collect(&self, idle_for: Duration) {
        let now = Instant::now();
        self.counters
            .retain(|_, counter| counter.lock().time_passed(now) <= idle_for.as_secs_f64());
    }

    pub fn tracked_tokens(&self) -> usize {
        self.counters.len()
    }
}

/// Builds the rate-limit token from the configured header set: the
/// non-empty values joined with `-`, in header-list order. An all-empty (or
/// all-absent) header set means "not rate limited" (empty token).
pub fn token_from_headers(rps_headers: &[String], lookup: impl Fn(&str) -> Option<String>) -> String {
    rps_headers
        .iter()
        .filter_map(|h| lookup(h))
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn allows_up_to_max_rps_then_limits() {
        let limiter = RateLimiter::new(2.0);
        assert!(!limiter.check("a"));
        assert!(!limiter.check("a"));
        // Third request within the same instant has no time to refill.
        assert!(limiter.check("a"));
    }

    #[test]
    fn tokens_are_independent() {
        let limiter = RateLimiter::new(1.0);
        assert!(!limiter.check("a"));
        assert!(!limiter.check("b"));
    }

    #[test]
    fn empty_token_is_never_limited() {
        let limiter = RateLimiter::new(0.0);
        assert!(!limiter.check(""));
        assert!(!limiter.check(""));
    }

    #[test]
    fn token_from_headers_joins_present_values_only() {
        let headers: HashMap<&str, &str> = [("X-Rate-Header", "abc")].into_iter().collect();
        let token = token_from_headers(&["X-Rate-Header".to_string(), "X-Other".to_string()], |h| {
            headers.get(h).map(|v| v.to_string())
        });
        assert_eq!(token, "abc");
    }
}
