//! Protocol version negotiation.
//!
//! A client may name the protocol version it speaks in the handshake
//! (`version=1` or `version=1.2`). The server admits any request with its own
//! major version and announces its full version in `connection.established`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version this server speaks.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// A `major.minor` protocol version. Minor bumps only add frames or fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// Why a requested version was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Malformed protocol version: {0:?}")]
    Malformed(String),

    #[error("Protocol version {requested} is not supported (server speaks {supported})")]
    Unsupported { requested: Version, supported: Version },
}

impl FromStr for Version {
    type Err = VersionError;

    /// Accepts `"1"` (any minor) or `"1.2"`, with an optional leading `v`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionError::Malformed(s.to_string());
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let (major, minor) = match digits.split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (digits, None),
        };
        let major = major.parse().map_err(|_| malformed())?;
        let minor = match minor {
            Some(minor) => minor.parse().map_err(|_| malformed())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Check a client's requested version against [`PROTOCOL_VERSION`].
///
/// No request means "whatever the server speaks". A newer minor is accepted;
/// the client simply will not see frames this server does not have.
///
/// # Errors
///
/// Fails for an unparseable version or a different major version.
pub fn negotiate(requested: Option<&str>) -> Result<Version, VersionError> {
    let Some(requested) = requested.filter(|r| !r.trim().is_empty()) else {
        return Ok(PROTOCOL_VERSION);
    };
    let requested: Version = requested.parse()?;
    if requested.major != PROTOCOL_VERSION.major {
        return Err(VersionError::Unsupported {
            requested,
            supported: PROTOCOL_VERSION,
        });
    }
    Ok(PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("1".parse::<Version>().unwrap(), Version { major: 1, minor: 0 });
        assert_eq!("v1.4".parse::<Version>().unwrap(), Version { major: 1, minor: 4 });
        assert!(matches!("one".parse::<Version>(), Err(VersionError::Malformed(_))));
        assert!("1.x".parse::<Version>().is_err());
        assert!("1.2.3".parse::<Version>().is_err());
    }

    #[test]
    fn test_negotiate_by_major() {
        assert_eq!(negotiate(None), Ok(PROTOCOL_VERSION));
        assert_eq!(negotiate(Some("")), Ok(PROTOCOL_VERSION));
        assert_eq!(negotiate(Some("1.7")), Ok(PROTOCOL_VERSION));
        assert!(matches!(
            negotiate(Some("2")),
            Err(VersionError::Unsupported { .. })
        ));
        assert!(matches!(negotiate(Some("0.9")), Err(VersionError::Unsupported { .. })));
    }

    #[test]
    fn test_announced_form() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
