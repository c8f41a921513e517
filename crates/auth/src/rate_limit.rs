//! Per-identity token buckets.
//!
//! Each identity gets `capacity` units per `period`. A bucket is refilled to
//! capacity all at once when a full period has passed since its last refill.
//! A non-positive capacity disables limiting.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: i64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(capacity: i64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, capacity: i64, period: Duration, now: Instant) {
        if now.duration_since(self.last_refill) >= period {
            self.tokens = capacity;
            self.last_refill = now;
        }
    }

    /// A bucket idle for a full period behaves exactly like a new one.
    fn is_idle(&self, period: Duration, now: Instant) -> bool {
        now.duration_since(self.last_refill) >= period
    }
}

pub struct RateLimiter {
    capacity: i64,
    period: Duration,
    max_tracked: usize,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    /// `max_tracked` bounds the number of identities kept in memory; zero
    /// means no bound.
    pub fn new(capacity: i64, period: Duration, max_tracked: usize) -> Self {
        Self {
            capacity,
            period,
            max_tracked,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Requests per minute for one identity.
    pub fn per_minute(capacity: i64, max_tracked: usize) -> Self {
        Self::new(capacity, Duration::from_secs(60), max_tracked)
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity <= 0
    }

    /// Create a bucket for `identity` if it has none.
    pub fn register(&self, identity: &str) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_bucket(&mut buckets, identity, now);
    }

    /// Take one unit from `identity`'s bucket. Returns `false` without
    /// touching the bucket when it is empty.
    pub fn consume(&self, identity: &str) -> bool {
        self.check(identity).is_ok()
    }

    /// Like [`consume`](Self::consume), but reports how long until the
    /// bucket refills on rejection.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = self.ensure_bucket(&mut buckets, identity, now);
        bucket.last_seen = now;
        bucket.refill(self.capacity, self.period, now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Ok(())
        } else {
            Err((bucket.last_refill + self.period).saturating_duration_since(now))
        }
    }

    /// Units left for `identity`, or `None` if it has no bucket yet.
    pub fn remaining(&self, identity: &str) -> Option<i64> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.get(identity).map(|b| b.tokens)
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn ensure_bucket<'a>(
        &self,
        buckets: &'a mut HashMap<String, TokenBucket>,
        identity: &str,
        now: Instant,
    ) -> &'a mut TokenBucket {
        if self.max_tracked > 0
            && buckets.len() >= self.max_tracked
            && !buckets.contains_key(identity)
        {
            self.evict(buckets, now);
        }
        buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now))
    }

    fn evict(&self, buckets: &mut HashMap<String, TokenBucket>, now: Instant) {
        let before = buckets.len();
        buckets.retain(|_, b| !b.is_idle(self.period, now));
        if buckets.len() < self.max_tracked {
            debug!(purged = before - buckets.len(), "purged idle rate limit buckets");
            return;
        }
        let oldest = buckets
            .iter()
            .min_by_key(|(_, b)| b.last_seen)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            buckets.remove(&id);
            debug!(identity = %id, "evicted least recently used rate limit bucket");
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread::sleep};

    const PERIOD: Duration = Duration::from_millis(50);

    #[test]
    fn allows_capacity_then_rejects() {
        let limiter = RateLimiter::new(3, PERIOD, 0);
        for _ in 0..3 {
            assert!(limiter.consume("1.2.3.4"));
        }
        assert!(!limiter.consume("1.2.3.4"));
        assert_eq!(limiter.remaining("1.2.3.4"), Some(0));
    }

    #[test]
    fn refills_after_period() {
        let limiter = RateLimiter::new(2, PERIOD, 0);
        assert!(limiter.consume("a"));
        assert!(limiter.consume("a"));
        assert!(!limiter.consume("a"));
        sleep(PERIOD + Duration::from_millis(10));
        assert!(limiter.consume("a"));
        assert!(limiter.consume("a"));
        assert!(!limiter.consume("a"));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 0);
        assert!(limiter.consume("1.2.3.4"));
        assert!(!limiter.consume("1.2.3.4"));
        assert!(limiter.consume("5.6.7.8"));
    }

    #[test]
    fn non_positive_capacity_is_unlimited() {
        for capacity in [0, -1] {
            let limiter = RateLimiter::new(capacity, Duration::from_secs(60), 0);
            for _ in 0..100 {
                assert!(limiter.consume("x"));
            }
            assert_eq!(limiter.tracked(), 0);
        }
    }

    #[test]
    fn rejection_reports_wait_and_keeps_state() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 0);
        limiter.consume("x");
        let wait = limiter.check("x").unwrap_err();
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(58));
        assert_eq!(limiter.remaining("x"), Some(0));
    }

    #[test]
    fn register_is_idempotent() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), 0);
        limiter.register("x");
        assert_eq!(limiter.remaining("x"), Some(2));
        limiter.consume("x");
        limiter.register("x");
        assert_eq!(limiter.remaining("x"), Some(1));
    }

    #[test]
    fn bounded_map_evicts_least_recently_used() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 2);
        assert!(limiter.consume("a"));
        sleep(Duration::from_millis(2));
        assert!(limiter.consume("b"));
        sleep(Duration::from_millis(2));
        assert!(limiter.consume("c"));
        assert_eq!(limiter.tracked(), 2);
        assert!(limiter.remaining("a").is_none());
        // Active identities keep their exhausted buckets.
        assert!(!limiter.consume("b"));
    }

    #[test]
    fn bounded_map_prefers_idle_buckets() {
        let limiter = RateLimiter::new(1, PERIOD, 2);
        limiter.consume("a");
        limiter.consume("b");
        sleep(PERIOD + Duration::from_millis(10));
        limiter.consume("c");
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.remaining("c"), Some(0));
    }
}
