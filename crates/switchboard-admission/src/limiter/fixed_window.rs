//! Fixed-window counter limiter.

use super::{ceiling, validate, RateLimitBackend, RateLimitDecision, RateLimitError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Counter for the current window of one key. Older windows are overwritten.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    bucket: u128,
    window: Duration,
    count: u32,
}

/// One counter per `(key, now - now mod window)`.
///
/// Windows are aligned to the limiter's creation instant. Up to `2 × limit`
/// calls can pass in a span shorter than one window when they straddle a
/// boundary; use [`SlidingWindowLimiter`](super::SlidingWindowLimiter) when
/// that matters.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    origin: Instant,
    counters: DashMap<String, WindowCounter>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            counters: DashMap::new(),
        }
    }

    /// Index of the window containing `now`, and the time left in it.
    fn locate(&self, now: Instant, window: Duration) -> (u128, Duration) {
        let elapsed = now.duration_since(self.origin).as_nanos();
        let width = window.as_nanos();
        let bucket = elapsed / width;
        let into = elapsed % width;
        let left = u64::try_from(width - into).unwrap_or(u64::MAX);
        (bucket, Duration::from_nanos(left))
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        "fixed_window"
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
        let (bucket, left) = self.locate(Instant::now(), window);

        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert(WindowCounter {
                bucket,
                window,
                count: 0,
            });
        if counter.bucket != bucket || counter.window != window {
            *counter = WindowCounter {
                bucket,
                window,
                count: 0,
            };
        }

        if counter.count >= max {
            return Ok(RateLimitDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                reset_after: left,
                retry_after: Some(left),
            });
        }

        counter.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit: max,
            remaining: max - counter.count,
            reset_after: left,
            retry_after: None,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn usage(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self
            .counters
            .get(key)
            .map(|counter| u64::from(counter.count))
            .unwrap_or(0))
    }

    async fn sweep(&self) -> Result<usize, RateLimitError> {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| self.locate(now, counter.window).0 == counter.bucket);
        Ok(before.saturating_sub(self.counters.len()))
    }
}
