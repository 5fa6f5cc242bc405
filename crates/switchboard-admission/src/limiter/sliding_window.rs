//! Sliding-window log limiter.

use super::{ceiling, validate, RateLimitBackend, RateLimitDecision, RateLimitError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Keeps the timestamp of every admitted call inside the window.
///
/// A call at `now` evicts timestamps at or before `now - window`, so the
/// admitted set always covers the half-open interval `(now - window, now]`.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    logs: DashMap<String, CallLog>,
}

/// Admitted calls of one key, with the window they were last checked under.
#[derive(Debug, Default)]
struct CallLog {
    window: Duration,
    calls: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn evict(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) >= window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest surviving entry leaves the window.
    fn until_oldest_expires(log: &VecDeque<Instant>, now: Instant, window: Duration) -> Duration {
        log.front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[async_trait]
impl RateLimitBackend for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst: Option<u32>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        validate(limit, window)?;
        let max = ceiling(limit, burst);
        let now = Instant::now();

        let mut entry = self.logs.entry(key.to_string()).or_default();
        entry.window = window;
        let log = &mut entry.calls;
        Self::evict(log, now, window);

        let count = log.len() as u32;
        if count >= max {
            let wait = Self::until_oldest_expires(log, now, window);
            trace!(key = %key, count, max, "Sliding window denied");
            return Ok(RateLimitDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                reset_after: wait,
                retry_after: Some(wait),
            });
        }

        log.push_back(now);
        Ok(RateLimitDecision {
            allowed: true,
            limit: max,
            remaining: max - count - 1,
            reset_after: Self::until_oldest_expires(log, now, window),
            retry_after: None,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.logs.remove(key);
        Ok(())
    }

    async fn usage(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self.logs.get(key).map(|log| log.calls.len() as u64).unwrap_or(0))
    }

    async fn sweep(&self) -> Result<usize, RateLimitError> {
        let now = Instant::now();
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            let window = log.window;
            Self::evict(&mut log.calls, now, window);
            !log.calls.is_empty()
        });
        Ok(before.saturating_sub(self.logs.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_no_boundary_double_burst() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(10);

        // Fill the limit late in the first window.
        tokio::time::advance(Duration::from_secs(9)).await;
        for _ in 0..3 {
            assert!(limiter.check("k", 3, window, None).await.unwrap().allowed);
        }

        // Crossing an aligned boundary does not help: those calls are still recent.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!limiter.check("k", 3, window, None).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_tracks_oldest_entry() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(10);

        limiter.check("k", 2, window, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        let decision = limiter.check("k", 2, window, None).await.unwrap();
        assert_eq!(decision.reset_after, Duration::from_secs(6));

        let denied = limiter.check("k", 2, window, None).await.unwrap();
        assert_eq!(denied.retry_after, Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_raises_ceiling() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(10);

        for _ in 0..4 {
            assert!(limiter.check("k", 2, window, Some(4)).await.unwrap().allowed);
        }
        assert!(!limiter.check("k", 2, window, Some(4)).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_window_never_exceeds_limit() {
        let limiter = SlidingWindowLimiter::new();
        let limit = 4u32;
        let window = Duration::from_secs(5);
        // Irregular gaps in milliseconds, cycled over many calls.
        let gaps = [0u64, 100, 1_700, 0, 2_300, 900, 50, 4_999, 1, 3_000];

        let start = Instant::now();
        let mut admitted: Vec<Duration> = Vec::new();
        for step in 0..200 {
            tokio::time::advance(Duration::from_millis(gaps[step % gaps.len()])).await;
            if limiter.check("k", limit, window, None).await.unwrap().allowed {
                admitted.push(Instant::now().duration_since(start));
            }
        }

        for (i, t) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|s| *t - **s < window)
                .count();
            assert!(in_window <= limit as usize, "{} calls in window ending at {:?}", in_window, t);
        }
    }
}
