//! The concrete admission stages.

use crate::auth::{RevocationList, TokenValidator};
use crate::identity::Identity;
use crate::limiter::RateLimitBackend;
use crate::pipeline::{AdmissionSubject, ConnectContext, FrameContext, Rejection, Stage, StageOutcome};
use crate::rules::{RuleAction, RuleResolution, RuleSet};
use crate::throttle::ConnectionThrottle;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::{codec, CloseCode};
use tracing::{debug, warn};

/// Default ceiling on concurrently open connections per identity.
pub const DEFAULT_MAX_CONNECTIONS_PER_IDENTITY: usize = 5;
/// Default bound on token validation.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);
/// Default bound on a rate-limit store round trip.
pub const DEFAULT_RATE_LIMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Rejects connections whose `Origin` is not allow-listed.
///
/// An empty allow-set disables the check.
#[derive(Debug, Clone, Default)]
pub struct OriginStage {
    allowed: HashSet<String>,
}

impl OriginStage {
    #[must_use]
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|o| normalize_origin(o.as_ref()))
                .collect(),
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[async_trait]
impl Stage<ConnectContext> for OriginStage {
    fn name(&self) -> &'static str {
        "origin"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::InvalidOrigin
    }

    async fn handle(&self, ctx: &mut ConnectContext) -> StageOutcome {
        if self.allowed.is_empty() {
            return StageOutcome::Continue;
        }
        match ctx.origin.as_deref().map(normalize_origin) {
            Some(origin) if self.allowed.contains(&origin) => StageOutcome::Continue,
            origin => StageOutcome::Reject(Rejection::new(
                CloseCode::InvalidOrigin,
                self.name(),
                format!("origin {:?} not allowed", origin),
            )),
        }
    }
}

/// Resolves the bearer token to an identity.
///
/// A revoked token is always rejected. A missing or invalid token becomes
/// [`Identity::Anonymous`] when anonymous access is allowed and is rejected
/// otherwise. Validator failures and timeouts are rejections.
pub struct IdentityStage {
    validator: Arc<dyn TokenValidator>,
    revocations: Arc<dyn RevocationList>,
    allow_anonymous: bool,
    timeout: Duration,
}

impl IdentityStage {
    #[must_use]
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        revocations: Arc<dyn RevocationList>,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            validator,
            revocations,
            allow_anonymous,
            timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn anonymous_or_reject(&self, ctx: &mut ConnectContext, why: &str) -> StageOutcome {
        if self.allow_anonymous {
            ctx.identity = Identity::Anonymous;
            StageOutcome::Continue
        } else {
            self.reject(why)
        }
    }

    fn reject(&self, why: impl Into<String>) -> StageOutcome {
        StageOutcome::Reject(Rejection::new(CloseCode::Unauthorized, "identity", why))
    }
}

#[async_trait]
impl Stage<ConnectContext> for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::Unauthorized
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn handle(&self, ctx: &mut ConnectContext) -> StageOutcome {
        let Some(token) = ctx.token.clone().filter(|t| !t.is_empty()) else {
            return self.anonymous_or_reject(ctx, "authentication required");
        };

        match self.revocations.is_revoked(&token).await {
            Ok(false) => {}
            Ok(true) => return self.reject("token revoked"),
            Err(e) => {
                warn!(error = %e, "Revocation check failed");
                return self.reject(e.to_string());
            }
        }

        match self.validator.validate(&token).await {
            Ok(Some(user)) => {
                debug!(user = %user.id, "Token accepted");
                ctx.identity = Identity::User(user);
                StageOutcome::Continue
            }
            Ok(None) => self.anonymous_or_reject(ctx, "invalid token"),
            Err(e) => {
                warn!(error = %e, "Token validation failed");
                self.reject(e.to_string())
            }
        }
    }
}

/// Caps concurrently open connections per identity, or per address for
/// anonymous callers. Stores the acquired permit in the context.
#[derive(Debug, Clone)]
pub struct ThrottleStage {
    throttle: ConnectionThrottle,
    max: usize,
}

impl ThrottleStage {
    #[must_use]
    pub fn new(throttle: ConnectionThrottle, max: usize) -> Self {
        Self { throttle, max }
    }

    /// Counter key for a caller.
    #[must_use]
    pub fn key_for(identity: &Identity, remote_addr: &str) -> String {
        match identity.user_id() {
            Some(id) => format!("user:{}", id),
            None => format!("addr:{}", remote_addr),
        }
    }
}

#[async_trait]
impl Stage<ConnectContext> for ThrottleStage {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::TooManyConnections
    }

    async fn handle(&self, ctx: &mut ConnectContext) -> StageOutcome {
        let key = Self::key_for(&ctx.identity, &ctx.remote_addr);
        match self.throttle.try_acquire(&key, self.max) {
            Some(permit) => {
                ctx.permit = Some(permit);
                StageOutcome::Continue
            }
            None => StageOutcome::Reject(Rejection::new(
                CloseCode::TooManyConnections,
                self.name(),
                format!("more than {} open connections", self.max),
            )),
        }
    }
}

/// Rejects frames larger than the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameSizeStage {
    max: usize,
}

impl FrameSizeStage {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Default for FrameSizeStage {
    fn default() -> Self {
        Self::new(codec::DEFAULT_MAX_FRAME_SIZE)
    }
}

#[async_trait]
impl Stage<FrameContext> for FrameSizeStage {
    fn name(&self) -> &'static str {
        "frame_size"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::MessageTooLarge
    }

    async fn handle(&self, ctx: &mut FrameContext) -> StageOutcome {
        match codec::check_size(ctx.size(), self.max) {
            Ok(()) => StageOutcome::Continue,
            Err(e) => StageOutcome::Reject(Rejection::new(
                CloseCode::MessageTooLarge,
                self.name(),
                e.to_string(),
            )),
        }
    }
}

/// Applies the matched rate-limit rule through a backend.
///
/// Usable in both pipelines: connect attempts are checked as the
/// `connect` operation, frames as their type (plus room).
#[derive(Clone)]
pub struct RateLimitStage {
    rules: Arc<RuleSet>,
    backend: Arc<dyn RateLimitBackend>,
    timeout: Duration,
}

impl RateLimitStage {
    #[must_use]
    pub fn new(rules: Arc<RuleSet>, backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            rules,
            backend,
            timeout: DEFAULT_RATE_LIMIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn evaluate<S: AdmissionSubject>(&self, subject: &mut S) -> StageOutcome {
        let operation = subject.operation();
        let applied = match self
            .rules
            .resolve(&operation, subject.identity(), subject.remote_addr())
        {
            RuleResolution::Apply(applied) => applied,
            RuleResolution::Bypass | RuleResolution::Unmatched => return StageOutcome::Continue,
        };

        let decision = match self
            .backend
            .check(&applied.key, applied.limit, applied.window, applied.burst)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Rate limit check failed");
                return StageOutcome::Reject(Rejection::new(
                    CloseCode::RateLimited,
                    "rate_limit",
                    e.to_string(),
                ));
            }
        };

        if decision.allowed {
            return StageOutcome::Continue;
        }

        let code = match applied.action {
            RuleAction::LogOnly => {
                warn!(
                    rule = %applied.rule,
                    key = %applied.key,
                    operation = %operation,
                    "Rate limit exceeded (log only)"
                );
                return StageOutcome::Continue;
            }
            RuleAction::Throttle => CloseCode::RateLimited,
            RuleAction::Block => CloseCode::Blocked,
            RuleAction::Challenge => CloseCode::ChallengeRequired,
        };

        debug!(rule = %applied.rule, key = %applied.key, ?code, "Rate limit exceeded");
        StageOutcome::Reject(
            Rejection::new(
                code,
                "rate_limit",
                format!("rule {} exceeded ({} per {:?})", applied.rule, decision.limit, applied.window),
            )
            .with_retry_after(decision.retry_after),
        )
    }
}

#[async_trait]
impl Stage<ConnectContext> for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::RateLimited
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn handle(&self, ctx: &mut ConnectContext) -> StageOutcome {
        self.evaluate(ctx).await
    }
}

#[async_trait]
impl Stage<FrameContext> for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn rejection_code(&self) -> CloseCode {
        CloseCode::RateLimited
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn handle(&self, ctx: &mut FrameContext) -> StageOutcome {
        self.evaluate(ctx).await
    }
}
