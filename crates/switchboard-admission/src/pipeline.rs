//! Ordered admission stages.
//!
//! A [`Pipeline`] runs its stages in order against a mutable context. The
//! first stage to reject stops the run; later stages never see the context.
//! A stage that exceeds its timeout is treated as a rejection with that
//! stage's own close code.

use crate::identity::Identity;
use crate::throttle::ConnectionPermit;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use switchboard_protocol::{codec, CloseCode, InboundFrame, ProtocolError};
use tracing::{debug, warn};

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: CloseCode,
    /// Name of the stage that refused.
    pub stage: &'static str,
    pub message: String,
    /// Set by rate-limit stages.
    pub retry_after: Option<Duration>,
}

impl Rejection {
    #[must_use]
    pub fn new(code: CloseCode, stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rejected ({}): {}", self.stage, self.code, self.message)
    }
}

impl std::error::Error for Rejection {}

/// Result of a single stage.
#[derive(Debug)]
pub enum StageOutcome {
    Continue,
    Reject(Rejection),
}

/// One admission check.
#[async_trait]
pub trait Stage<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Close code used when the stage times out.
    fn rejection_code(&self) -> CloseCode;

    /// Upper bound on [`Stage::handle`]; `None` runs unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn handle(&self, ctx: &mut C) -> StageOutcome;
}

/// Runs stages in order, stopping at the first rejection.
pub struct Pipeline<C> {
    stages: Vec<Box<dyn Stage<C>>>,
}

impl<C: Send> Pipeline<C> {
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stage names in run order.
    pub fn stage_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stages.iter().map(|s| s.name())
    }

    /// Run every stage against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`].
    pub async fn run(&self, ctx: &mut C) -> Result<(), Rejection> {
        for stage in &self.stages {
            let outcome = match stage.timeout() {
                Some(limit) => match tokio::time::timeout(limit, stage.handle(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(stage = stage.name(), ?limit, "Admission stage timed out");
                        StageOutcome::Reject(Rejection::new(
                            stage.rejection_code(),
                            stage.name(),
                            "admission check timed out",
                        ))
                    }
                },
                None => stage.handle(ctx).await,
            };

            if let StageOutcome::Reject(rejection) = outcome {
                debug!(
                    stage = rejection.stage,
                    code = rejection.code.code(),
                    message = %rejection.message,
                    "Admission rejected"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a rate-limit stage needs to know about the caller.
pub trait AdmissionSubject: Send {
    fn identity(&self) -> &Identity;
    fn remote_addr(&self) -> &str;
    /// Operation name matched against rule patterns.
    fn operation(&mut self) -> String;
}

/// State carried through the connect pipeline.
#[derive(Debug, Default)]
pub struct ConnectContext {
    pub origin: Option<String>,
    pub token: Option<String>,
    pub remote_addr: String,
    /// Resolved by the identity stage.
    pub identity: Identity,
    /// Filled by the throttle stage; the session holds it until close.
    pub permit: Option<ConnectionPermit>,
}

impl ConnectContext {
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

impl AdmissionSubject for ConnectContext {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn operation(&mut self) -> String {
        "connect".to_string()
    }
}

/// State carried through the per-frame pipeline.
///
/// The frame is decoded at most once, on first demand, so an oversized
/// frame rejected by size is never parsed.
#[derive(Debug)]
pub struct FrameContext {
    pub identity: Identity,
    pub remote_addr: String,
    pub connection_id: String,
    pub text: String,
    decoded: Option<Result<InboundFrame, ProtocolError>>,
}

impl FrameContext {
    #[must_use]
    pub fn new(
        identity: Identity,
        remote_addr: impl Into<String>,
        connection_id: impl Into<String>,
        text: String,
    ) -> Self {
        Self {
            identity,
            remote_addr: remote_addr.into(),
            connection_id: connection_id.into(),
            text,
            decoded: None,
        }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.text.len()
    }

    fn decoded(&mut self) -> &Result<InboundFrame, ProtocolError> {
        let text = &self.text;
        self.decoded.get_or_insert_with(|| codec::decode(text))
    }

    /// Take the decoded frame out of the context.
    ///
    /// # Errors
    ///
    /// Returns the decode error for a malformed or unknown frame.
    pub fn take_decoded(&mut self) -> Result<InboundFrame, ProtocolError> {
        match self.decoded.take() {
            Some(decoded) => decoded,
            None => codec::decode(&self.text),
        }
    }
}

impl AdmissionSubject for FrameContext {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// `<type>` or `<type>:<room>`; undecodable frames count as `invalid`.
    fn operation(&mut self) -> String {
        match self.decoded() {
            Ok(frame) => match frame.room() {
                Some(room) => format!("{}:{}", frame.type_name(), room),
                None => frame.type_name().to_string(),
            },
            Err(_) => "invalid".to_string(),
        }
    }
}
