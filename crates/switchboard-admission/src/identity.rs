//! Resolved identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An authenticated user as returned by token validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user identifier.
    pub id: String,
    /// Groups/roles the user belongs to, used by rule role constraints.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserIdentity {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Owner of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Identity {
    User(UserIdentity),
    #[default]
    Anonymous,
}

impl Identity {
    /// Shorthand for a user identity without groups.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Identity::User(UserIdentity::new(id))
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    /// The user id, or `None` for anonymous connections.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User(user) => Some(&user.id),
            Identity::Anonymous => None,
        }
    }

    /// Whether the identity belongs to `group`. Anonymous identities belong to none.
    #[must_use]
    pub fn has_group(&self, group: &str) -> bool {
        match self {
            Identity::User(user) => user.groups.iter().any(|g| g == group),
            Identity::Anonymous => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(user) => write!(f, "{}", user.id),
            Identity::Anonymous => write!(f, "anonymous"),
        }
    }
}

impl From<UserIdentity> for Identity {
    fn from(user: UserIdentity) -> Self {
        Identity::User(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_accessors() {
        let user = Identity::from(UserIdentity::new("alice").with_groups(["staff"]));
        assert_eq!(user.user_id(), Some("alice"));
        assert!(user.has_group("staff"));
        assert!(!user.has_group("admin"));
        assert_eq!(user.to_string(), "alice");

        let anon = Identity::Anonymous;
        assert!(anon.is_anonymous());
        assert_eq!(anon.user_id(), None);
        assert_eq!(anon.to_string(), "anonymous");
    }
}
