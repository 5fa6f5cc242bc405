//! Credential extraction and validation.
//!
//! Token issuance lives outside Switchboard; this module only consumes the
//! validation capability through [`TokenValidator`] and consults a
//! [`RevocationList`] before trusting a token.

use crate::identity::UserIdentity;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

/// Token extraction and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Authorization header or token parameter not present.
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>".
    #[error("Invalid authorization token format")]
    InvalidFormat,
    /// Token is an empty string.
    #[error("Authorization token is empty")]
    Empty,
    /// The validation capability could not be reached.
    #[error("Token validation unavailable: {0}")]
    Unavailable(String),
}

/// Parse a bearer token from an `Authorization` header value.
///
/// The scheme is matched case-insensitively and surrounding whitespace on the
/// token is ignored.
///
/// # Errors
///
/// Returns [`TokenError::InvalidFormat`] for a non-bearer value and
/// [`TokenError::Empty`] for a bearer value without a token.
pub fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let mut parts = header_value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Verifies a bearer token and resolves it to a user.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns `Ok(None)` for an invalid or expired token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Unavailable`] when validation itself failed;
    /// callers treat that as a rejection.
    async fn validate(&self, token: &str) -> Result<Option<UserIdentity>, TokenError>;
}

/// Revoked-token lookup.
#[async_trait]
pub trait RevocationList: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TokenError::Unavailable`] when the list cannot be consulted.
    async fn is_revoked(&self, token: &str) -> Result<bool, TokenError>;
}

/// Token table held in memory, filled from configuration.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: DashMap<String, UserIdentity>,
}

impl StaticTokenValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user.
    pub fn insert(&self, token: impl Into<String>, user: UserIdentity) {
        self.tokens.insert(token.into(), user);
    }

    /// Forget a token.
    pub fn remove(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.remove(token).map(|(_, user)| user)
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<UserIdentity>, TokenError> {
        Ok(self.tokens.get(token).map(|entry| entry.value().clone()))
    }
}

/// In-memory set of revoked tokens.
#[derive(Debug, Default)]
pub struct InMemoryRevocationList {
    revoked: DashSet<String>,
}

impl InMemoryRevocationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, token: impl Into<String>) {
        self.revoked.insert(token.into());
    }
}

#[async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn is_revoked(&self, token: &str) -> Result<bool, TokenError> {
        Ok(self.revoked.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc123").unwrap(), "abc123");
        assert_eq!(parse_bearer_token("bearer   abc123  ").unwrap(), "abc123");
        assert_eq!(parse_bearer_token("Basic abc123"), Err(TokenError::InvalidFormat));
        assert_eq!(parse_bearer_token("Bearer"), Err(TokenError::InvalidFormat));
        assert_eq!(parse_bearer_token("Bearer    "), Err(TokenError::Empty));
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticTokenValidator::new();
        validator.insert("t-alice", UserIdentity::new("alice"));

        let user = validator.validate("t-alice").await.unwrap();
        assert_eq!(user.map(|u| u.id), Some("alice".to_string()));
        assert!(validator.validate("t-nobody").await.unwrap().is_none());

        validator.remove("t-alice");
        assert!(validator.validate("t-alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revocation_list() {
        let list = InMemoryRevocationList::new();
        assert!(!list.is_revoked("t1").await.unwrap());
        list.revoke("t1");
        assert!(list.is_revoked("t1").await.unwrap());
    }
}
