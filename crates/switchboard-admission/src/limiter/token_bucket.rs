//! Token bucket limiter.

use super::{ceiling, validate, RateLimitBackend, RateLimitDecision, RateLimitError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket state for a single key.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Refill based on elapsed time, capped at capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.capacity
    }
}

/// Per-key token bucket: `refill_rate = limit / window`, `capacity = burst or limit`.
///
/// Buckets are created full on first use. A changed capacity for an existing
/// key takes effect immediately and clamps the current token count.
#[derive(Debug, Default)]
pub struct TokenBucketLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for TokenBucketLimiter {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst: Option<u32>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        validate(limit, window)?;
        let capacity = f64::from(ceiling(limit, burst));
        let refill_rate = f64::from(limit) / window.as_secs_f64();
        let now = Instant::now();

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(capacity, refill_rate, now));
        bucket.refill(now);
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;
        bucket.tokens = bucket.tokens.min(capacity);

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let retry_after = (!allowed)
            .then(|| Duration::from_secs_f64((1.0 - bucket.tokens) / refill_rate));

        Ok(RateLimitDecision {
            allowed,
            limit: capacity as u32,
            remaining: bucket.tokens.floor() as u32,
            reset_after: Duration::from_secs_f64((capacity - bucket.tokens) / refill_rate),
            retry_after,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.remove(key);
        Ok(())
    }

    async fn usage(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self
            .buckets
            .get(key)
            .map(|bucket| (bucket.capacity - bucket.tokens).max(0.0).ceil() as u64)
            .unwrap_or(0))
    }

    async fn sweep(&self) -> Result<usize, RateLimitError> {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(now);
            !bucket.is_full()
        });
        Ok(before.saturating_sub(self.buckets.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_allows_capacity_then_denies() {
        let limiter = TokenBucketLimiter::new();
        let window = Duration::from_secs(60);

        for _ in 0..8 {
            assert!(limiter.check("k", 4, window, Some(8)).await.unwrap().allowed);
        }

        let denied = limiter.check("k", 4, window, Some(8)).await.unwrap();
        assert!(!denied.allowed);
        let retry = denied.retry_after.unwrap();
        assert!(retry > Duration::ZERO);
        // 4 tokens per minute: one token every 15 seconds.
        assert!((retry.as_secs_f64() - 15.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill() {
        let limiter = TokenBucketLimiter::new();
        let window = Duration::from_secs(10);

        for _ in 0..10 {
            limiter.check("k", 10, window, None).await.unwrap();
        }
        assert!(!limiter.check("k", 10, window, None).await.unwrap().allowed);

        // One token per second.
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert!(limiter.check("k", 10, window, None).await.unwrap().allowed);
        assert!(limiter.check("k", 10, window, None).await.unwrap().allowed);
        assert!(!limiter.check("k", 10, window, None).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let limiter = TokenBucketLimiter::new();
        let window = Duration::from_secs(1);

        limiter.check("k", 3, window, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let decision = limiter.check("k", 3, window, None).await.unwrap();
        assert_eq!(decision.remaining, 2);
    }
}
