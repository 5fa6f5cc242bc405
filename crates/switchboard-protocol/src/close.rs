//! Transport close codes.
//!
//! Admission failures always terminate the transport with one of these codes,
//! so clients can tell "bad origin" apart from "too many connections" without
//! parsing free text. The numeric values are part of the public contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable close codes sent when the server ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum CloseCode {
    /// Clean close initiated by either side.
    Normal = 1000,
    /// Server is shutting down.
    GoingAway = 1001,
    /// Origin header not in the allow-set.
    InvalidOrigin = 4001,
    /// Missing, invalid or revoked credential.
    Unauthorized = 4002,
    /// Per-identity connection ceiling reached.
    TooManyConnections = 4003,
    /// Inbound frame exceeded the size ceiling.
    MessageTooLarge = 4004,
    /// Inbound frame rate exceeded.
    RateLimited = 4005,
    /// A rate-limit rule with the `block` action matched.
    Blocked = 4006,
    /// A rate-limit rule with the `challenge` action matched.
    ChallengeRequired = 4007,
    /// Closed through the administrative surface.
    ForceDisconnected = 4008,
    /// No inbound traffic within the staleness threshold.
    Stale = 4009,
    /// The handshake asked for a protocol major this server does not speak.
    UnsupportedVersion = 4010,
}

impl CloseCode {
    /// Numeric close code.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Short machine-readable reason sent alongside the code.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Normal => "normal",
            CloseCode::GoingAway => "going_away",
            CloseCode::InvalidOrigin => "invalid_origin",
            CloseCode::Unauthorized => "unauthorized",
            CloseCode::TooManyConnections => "too_many_connections",
            CloseCode::MessageTooLarge => "message_too_large",
            CloseCode::RateLimited => "rate_limited",
            CloseCode::Blocked => "blocked",
            CloseCode::ChallengeRequired => "challenge_required",
            CloseCode::ForceDisconnected => "force_disconnected",
            CloseCode::Stale => "stale",
            CloseCode::UnsupportedVersion => "unsupported_version",
        }
    }

    /// Whether this code reports an admission-control rejection.
    #[must_use]
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            CloseCode::InvalidOrigin
                | CloseCode::Unauthorized
                | CloseCode::TooManyConnections
                | CloseCode::MessageTooLarge
                | CloseCode::RateLimited
                | CloseCode::Blocked
                | CloseCode::ChallengeRequired
                | CloseCode::UnsupportedVersion
        )
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1000 => Ok(CloseCode::Normal),
            1001 => Ok(CloseCode::GoingAway),
            4001 => Ok(CloseCode::InvalidOrigin),
            4002 => Ok(CloseCode::Unauthorized),
            4003 => Ok(CloseCode::TooManyConnections),
            4004 => Ok(CloseCode::MessageTooLarge),
            4005 => Ok(CloseCode::RateLimited),
            4006 => Ok(CloseCode::Blocked),
            4007 => Ok(CloseCode::ChallengeRequired),
            4008 => Ok(CloseCode::ForceDisconnected),
            4009 => Ok(CloseCode::Stale),
            4010 => Ok(CloseCode::UnsupportedVersion),
            _ => Err("Invalid close code"),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::try_from(4003), Ok(CloseCode::TooManyConnections));
        assert_eq!(u16::from(CloseCode::MessageTooLarge), 4004);
        assert!(CloseCode::try_from(4999).is_err());
    }

    #[test]
    fn test_rejection_codes_are_distinct() {
        let codes = [
            CloseCode::InvalidOrigin,
            CloseCode::Unauthorized,
            CloseCode::TooManyConnections,
            CloseCode::MessageTooLarge,
            CloseCode::RateLimited,
            CloseCode::UnsupportedVersion,
        ];
        let mut seen = std::collections::HashSet::new();
        for code in codes {
            assert!(code.is_rejection());
            assert!(seen.insert(code.code()));
        }
        assert!(!CloseCode::Normal.is_rejection());
    }
}
