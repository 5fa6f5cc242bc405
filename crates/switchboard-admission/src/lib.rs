//! # switchboard-admission
//!
//! Admission control for Switchboard. Everything here runs before any room or
//! message logic sees a connection or a frame:
//!
//! - **Identity** - Bearer token validation and revocation
//! - **Throttle** - Per-identity concurrent connection ceiling
//! - **Limiter** - Sliding-window, token-bucket and fixed-window backends
//! - **Rules** - Priority-ordered rate-limit rules with overrides
//! - **Pipeline** - Ordered stages with short-circuit rejection
//!
//! ## Architecture
//!
//! ```text
//! connect:  Origin ──▶ Identity ──▶ Throttle ──▶ RateLimit("connect")
//! frame:    Size ──▶ RateLimit(<frame type>[:<room>])
//! ```
//!
//! Every rejection carries a [`CloseCode`](switchboard_protocol::CloseCode)
//! that the session uses to close the transport.

pub mod auth;
pub mod identity;
pub mod limiter;
pub mod pipeline;
pub mod rules;
pub mod stages;
pub mod throttle;

pub use auth::{
    parse_bearer_token, InMemoryRevocationList, RevocationList, StaticTokenValidator, TokenError,
    TokenValidator,
};
pub use identity::{Identity, UserIdentity};
pub use limiter::{
    build_backend, FixedWindowLimiter, LimiterKind, RateLimitBackend, RateLimitDecision,
    RateLimitError, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use pipeline::{
    AdmissionSubject, ConnectContext, FrameContext, Pipeline, Rejection, Stage, StageOutcome,
};
pub use rules::{
    AppliedRule, KeyStrategy, RateLimitRule, RuleAction, RuleConfig, RuleError, RuleOverride,
    RuleResolution, RuleSet,
};
pub use stages::{FrameSizeStage, IdentityStage, OriginStage, RateLimitStage, ThrottleStage};
pub use throttle::{ConnectionPermit, ConnectionThrottle};
