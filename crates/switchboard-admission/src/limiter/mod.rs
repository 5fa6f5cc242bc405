//! Rate-limit backends.
//!
//! Three algorithms share one contract. They differ in how they treat window
//! boundaries:
//!
//! - [`SlidingWindowLimiter`] keeps every timestamp and never admits more than
//!   `limit` calls in any trailing window.
//! - [`TokenBucketLimiter`] refills continuously and allows short bursts up to
//!   the bucket capacity.
//! - [`FixedWindowLimiter`] keeps one counter per aligned window. A client can
//!   get up to `2 × limit` calls through by straddling a boundary; that is the
//!   price of O(1) state and is expected behavior for this backend.
//!
//! All state for a key is mutated while holding that key's map entry, so two
//! callers racing on the same key never both see the pre-increment count.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Rate-limit backend errors.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// A zero limit or zero-length window was requested.
    #[error("Invalid rate limit: {0}")]
    InvalidLimit(&'static str),

    /// The counter store could not be reached.
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a single [`RateLimitBackend::check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the call is admitted.
    pub allowed: bool,
    /// Effective ceiling (the burst allowance when one is configured).
    pub limit: u32,
    /// Calls still available before the next denial.
    pub remaining: u32,
    /// Time until the key's state fully resets.
    pub reset_after: Duration,
    /// Set only on denial: how long to wait before the next call can succeed.
    pub retry_after: Option<Duration>,
}

/// A pluggable rate-limit counter store.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Check `key` against `limit` calls per `window`, recording the call when admitted.
    ///
    /// `burst`, when set, replaces `limit` as the ceiling (the bucket capacity
    /// for the token bucket).
    ///
    /// # Errors
    ///
    /// Returns an error for a zero limit or window, or when the store fails.
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst: Option<u32>,
    ) -> Result<RateLimitDecision, RateLimitError>;

    /// Drop all state for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Calls currently counted against `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    async fn usage(&self, key: &str) -> Result<u64, RateLimitError>;

    /// Drop keys whose state has fully reset, as if they had never been
    /// checked. Returns the number of keys removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    async fn sweep(&self) -> Result<usize, RateLimitError> {
        Ok(0)
    }
}

/// Selects a backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    #[default]
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

/// Build the in-memory backend for `kind`.
#[must_use]
pub fn build_backend(kind: LimiterKind) -> Arc<dyn RateLimitBackend> {
    match kind {
        LimiterKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new()),
        LimiterKind::TokenBucket => Arc::new(TokenBucketLimiter::new()),
        LimiterKind::FixedWindow => Arc::new(FixedWindowLimiter::new()),
    }
}

fn ceiling(limit: u32, burst: Option<u32>) -> u32 {
    burst.filter(|b| *b > 0).unwrap_or(limit)
}

fn validate(limit: u32, window: Duration) -> Result<(), RateLimitError> {
    if limit == 0 {
        return Err(RateLimitError::InvalidLimit("limit must be positive"));
    }
    if window.is_zero() {
        return Err(RateLimitError::InvalidLimit("window must be positive"));
    }
    Ok(())
}
