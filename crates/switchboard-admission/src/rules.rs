//! Rate-limit rule matching.
//!
//! Rules are evaluated in descending priority. The first rule whose pattern
//! matches the operation and whose group constraint (if any) the identity
//! satisfies is applied. A live per-identity override replaces the matched
//! rule's limit and burst. Addresses on the allow-list bypass every rule and
//! are checked before anything else.

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// How the counter key is derived from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One counter per user; anonymous callers fall back to their address.
    #[default]
    PerIdentity,
    PerAddress,
    PerIdentityAndAddress,
    /// One counter shared by every caller.
    Global,
}

/// What happens when a rule's limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Reject with the rate-limited code (429-equivalent).
    #[default]
    Throttle,
    /// Reject with the blocked code (403-equivalent).
    Block,
    /// Reject with the challenge-required code.
    Challenge,
    /// Log and admit.
    LogOnly,
}

/// Rule configuration errors.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid pattern in rule {rule}: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule {0} must have a positive limit and window")]
    ZeroLimit(String),
}

/// Serializable rule definition, compiled into a [`RateLimitRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Regex matched against the operation (`connect`, `message.send:general`, ...).
    pub pattern: String,
    #[serde(default)]
    pub required_group: Option<String>,
    pub limit: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub strategy: KeyStrategy,
    #[serde(default)]
    pub action: RuleAction,
}

/// A compiled rate-limit rule.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub name: String,
    pub pattern: Regex,
    pub required_group: Option<String>,
    pub limit: u32,
    pub window: Duration,
    pub burst: Option<u32>,
    pub priority: i32,
    pub strategy: KeyStrategy,
    pub action: RuleAction,
}

impl RateLimitRule {
    /// Compile a rule definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid regex or the limit is zero.
    pub fn from_config(config: &RuleConfig) -> Result<Self, RuleError> {
        if config.limit == 0 || config.window_secs == 0 {
            return Err(RuleError::ZeroLimit(config.name.clone()));
        }
        let pattern = Regex::new(&config.pattern).map_err(|source| RuleError::Pattern {
            rule: config.name.clone(),
            source,
        })?;

        Ok(Self {
            name: config.name.clone(),
            pattern,
            required_group: config.required_group.clone(),
            limit: config.limit,
            window: Duration::from_secs(config.window_secs),
            burst: config.burst,
            priority: config.priority,
            strategy: config.strategy,
            action: config.action,
        })
    }

    fn matches(&self, operation: &str, identity: &Identity) -> bool {
        if !self.pattern.is_match(operation) {
            return false;
        }
        match &self.required_group {
            Some(group) => identity.has_group(group),
            None => true,
        }
    }

    fn key_for(&self, identity: &Identity, remote_addr: &str) -> String {
        let subject = match (self.strategy, identity.user_id()) {
            (KeyStrategy::Global, _) => "*".to_string(),
            (KeyStrategy::PerAddress, _) | (KeyStrategy::PerIdentity, None) => {
                format!("addr:{}", remote_addr)
            }
            (KeyStrategy::PerIdentity, Some(id)) => format!("user:{}", id),
            (KeyStrategy::PerIdentityAndAddress, id) => {
                format!("user:{}|addr:{}", id.unwrap_or("anonymous"), remote_addr)
            }
        };
        format!("rl:{}:{}", self.name, subject)
    }
}

/// A per-identity replacement for a matched rule's limit and burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOverride {
    pub identity: String,
    pub limit: u32,
    #[serde(default)]
    pub burst: Option<u32>,
    /// `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RuleOverride {
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// The limit to enforce for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRule {
    pub rule: String,
    pub key: String,
    pub limit: u32,
    pub window: Duration,
    pub burst: Option<u32>,
    pub action: RuleAction,
}

/// Result of resolving rules for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResolution {
    /// The caller's address is allow-listed.
    Bypass,
    /// No rule matched.
    Unmatched,
    Apply(AppliedRule),
}

/// Priority-ordered rules plus overrides and the address allow-list.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
    overrides: DashMap<String, RuleOverride>,
    allow_addresses: HashSet<String>,
}

impl RuleSet {
    /// Build a rule set; rules are sorted by descending priority.
    ///
    /// Rules with equal priority keep their configured order.
    #[must_use]
    pub fn new(mut rules: Vec<RateLimitRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            overrides: DashMap::new(),
            allow_addresses: HashSet::new(),
        }
    }

    /// Compile rule definitions into a rule set.
    ///
    /// # Errors
    ///
    /// Returns the first rule that fails to compile.
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .map(RateLimitRule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    #[must_use]
    pub fn with_allow_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Install or replace the override for an identity.
    pub fn set_override(&self, rule_override: RuleOverride) {
        self.overrides
            .insert(rule_override.identity.clone(), rule_override);
    }

    pub fn clear_override(&self, identity: &str) {
        self.overrides.remove(identity);
    }

    #[must_use]
    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    /// Resolve the rule to apply for `operation`.
    #[must_use]
    pub fn resolve(&self, operation: &str, identity: &Identity, remote_addr: &str) -> RuleResolution {
        if self.allow_addresses.contains(remote_addr) {
            return RuleResolution::Bypass;
        }

        let Some(rule) = self.rules.iter().find(|r| r.matches(operation, identity)) else {
            return RuleResolution::Unmatched;
        };

        let (limit, burst) = identity
            .user_id()
            .and_then(|id| self.overrides.get(id))
            .filter(|o| o.is_active(Utc::now()))
            .map(|o| (o.limit, o.burst))
            .unwrap_or((rule.limit, rule.burst));

        RuleResolution::Apply(AppliedRule {
            rule: rule.name.clone(),
            key: rule.key_for(identity, remote_addr),
            limit,
            window: rule.window,
            burst,
            action: rule.action,
        })
    }
}
