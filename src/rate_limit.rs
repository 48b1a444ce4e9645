use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Returned when a client has spent its generation budget.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("composite generation budget exhausted, retry in {}s", retry_after.as_secs())]
pub struct Throttled {
    pub limit: u64,
    pub retry_after: Duration,
}

/// Per-client budget for cache misses. Every new composite costs one token;
/// cache hits and coalesced requests are free.
#[derive(Clone)]
pub struct GenerationLimiter {
    refill_per_second: f64,
    burst: f64,
    budgets: Arc<DashMap<IpAddr, Budget>>,
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    tokens: f64,
    refilled_at: Instant,
}

impl Budget {
    fn available(&self, now: Instant, refill_per_second: f64, burst: f64) -> f64 {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        (self.tokens + elapsed * refill_per_second).min(burst)
    }
}

impl GenerationLimiter {
    /// `None` when `per_minute` is zero. A zero burst defaults to one minute's worth.
    pub fn new(per_minute: u64, burst: u64) -> Option<Self> {
        if per_minute == 0 {
            return None;
        }
        let burst = if burst == 0 { per_minute } else { burst };
        Some(Self {
            refill_per_second: per_minute as f64 / 60.0,
            burst: burst as f64,
            budgets: Arc::new(DashMap::new()),
        })
    }

    pub fn try_acquire(&self, client: IpAddr) -> Result<(), Throttled> {
        self.try_acquire_at(client, Instant::now())
    }

    fn try_acquire_at(&self, client: IpAddr, now: Instant) -> Result<(), Throttled> {
        if self.budgets.len() >= MAX_TRACKED_CLIENTS {
            self.forget_full_budgets(now);
        }
        let mut budget = self.budgets.entry(client).or_insert(Budget {
            tokens: self.burst,
            refilled_at: now,
        });
        let tokens = budget.available(now, self.refill_per_second, self.burst);
        budget.refilled_at = now;
        if tokens >= 1.0 {
            budget.tokens = tokens - 1.0;
            return Ok(());
        }
        budget.tokens = tokens;
        let wait = ((1.0 - tokens) / self.refill_per_second).ceil().max(1.0);
        Err(Throttled {
            limit: self.burst as u64,
            retry_after: Duration::from_secs(wait as u64),
        })
    }

    /// A budget that has refilled completely is indistinguishable from a new one.
    fn forget_full_budgets(&self, now: Instant) {
        let (refill, burst) = (self.refill_per_second, self.burst);
        self.budgets
            .retain(|_, budget| budget.available(now, refill, burst) < burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn zero_rate_disables_the_limiter() {
        assert!(GenerationLimiter::new(0, 5).is_none());
    }

    #[test]
    fn burst_is_spent_per_client() {
        let limiter = GenerationLimiter::new(60, 2).unwrap();
        let now = Instant::now();
        assert!(limiter.try_acquire_at(ip("203.0.113.7"), now).is_ok());
        assert!(limiter.try_acquire_at(ip("203.0.113.7"), now).is_ok());
        let throttled = limiter
            .try_acquire_at(ip("203.0.113.7"), now)
            .unwrap_err();
        assert_eq!(throttled.limit, 2);
        assert_eq!(throttled.retry_after, Duration::from_secs(1));
        assert!(limiter.try_acquire_at(ip("203.0.113.8"), now).is_ok());
    }

    #[test]
    fn budget_refills_over_time() {
        let limiter = GenerationLimiter::new(60, 1).unwrap();
        let start = Instant::now();
        assert!(limiter.try_acquire_at(ip("198.51.100.1"), start).is_ok());
        assert!(limiter.try_acquire_at(ip("198.51.100.1"), start).is_err());
        let later = start + Duration::from_millis(1_100);
        assert!(limiter.try_acquire_at(ip("198.51.100.1"), later).is_ok());
    }

    #[test]
    fn full_budgets_are_forgotten() {
        let limiter = GenerationLimiter::new(60, 1).unwrap();
        let start = Instant::now();
        limiter.try_acquire_at(ip("198.51.100.1"), start).unwrap();
        limiter.try_acquire_at(ip("198.51.100.2"), start).unwrap();
        limiter.forget_full_budgets(start + Duration::from_millis(500));
        assert_eq!(limiter.budgets.len(), 2);
        limiter.forget_full_budgets(start + Duration::from_secs(5));
        assert!(limiter.budgets.is_empty());
    }
}
