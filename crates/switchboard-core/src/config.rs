//! Hub configuration.
//!
//! These sections are embedded in the server's configuration file; every
//! field has a default so an empty file yields a working hub.

use crate::room::RoomSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_admission::{KeyStrategy, LimiterKind, RuleAction, RuleConfig};
use switchboard_protocol::codec::DEFAULT_MAX_FRAME_SIZE;

/// Everything the hub needs besides its collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Rooms created at startup unless they already exist.
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
}

/// Admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Accepted `Origin` values; empty accepts any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Admit connections without a valid token as anonymous.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Concurrent connections per identity (per address when anonymous).
    #[serde(default = "default_max_connections_per_identity")]
    pub max_connections_per_identity: usize,

    /// Frame size ceiling in bytes; larger frames close the connection.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    #[serde(default = "default_broker_timeout_ms")]
    pub broker_timeout_ms: u64,

    #[serde(default = "default_rate_limit_timeout_ms")]
    pub rate_limit_timeout_ms: u64,

    /// Rate-limit algorithm.
    #[serde(default)]
    pub limiter: LimiterKind,

    /// Rate-limit rules, highest priority first after sorting.
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,

    /// Addresses that bypass every rate-limit rule.
    #[serde(default)]
    pub allow_addresses: Vec<String>,
}

/// Connection sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a connection is closed as stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long a closing session may spend writing queued frames.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Messages included in `room.joined`.
    #[serde(default = "default_history_on_join")]
    pub history_on_join: usize,
}

/// Message and presence retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Global retention ceiling in days; 0 keeps messages forever unless
    /// the room sets its own limit.
    #[serde(default = "default_global_days")]
    pub global_days: u32,

    #[serde(default = "default_retention_sweep_secs")]
    pub sweep_interval_secs: u64,

    /// Offline presence records idle this long are deleted.
    #[serde(default = "default_presence_stale_secs")]
    pub presence_stale_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_connections_per_identity() -> usize {
    switchboard_admission::stages::DEFAULT_MAX_CONNECTIONS_PER_IDENTITY
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_auth_timeout_ms() -> u64 {
    2_000
}

fn default_broker_timeout_ms() -> u64 {
    1_000
}

fn default_rate_limit_timeout_ms() -> u64 {
    1_000
}

/// Connect attempts per address, and frames per identity.
#[must_use]
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            name: "connect".to_string(),
            pattern: "^connect$".to_string(),
            required_group: None,
            limit: 30,
            window_secs: 60,
            burst: None,
            priority: 10,
            strategy: KeyStrategy::PerAddress,
            action: RuleAction::Throttle,
        },
        RuleConfig {
            name: "frames".to_string(),
            pattern: ".*".to_string(),
            required_group: None,
            limit: 100,
            window_secs: 10,
            burst: None,
            priority: 0,
            strategy: KeyStrategy::PerIdentity,
            action: RuleAction::Throttle,
        },
    ]
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_flush_timeout_ms() -> u64 {
    1_000
}

fn default_history_on_join() -> usize {
    50
}

fn default_global_days() -> u32 {
    30
}

fn default_retention_sweep_secs() -> u64 {
    3_600
}

fn default_presence_stale_secs() -> u64 {
    86_400
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_anonymous: true,
            max_connections_per_identity: default_max_connections_per_identity(),
            max_frame_bytes: default_max_frame_bytes(),
            auth_timeout_ms: default_auth_timeout_ms(),
            broker_timeout_ms: default_broker_timeout_ms(),
            rate_limit_timeout_ms: default_rate_limit_timeout_ms(),
            limiter: LimiterKind::default(),
            rules: default_rules(),
            allow_addresses: Vec::new(),
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    #[must_use]
    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    #[must_use]
    pub fn rate_limit_timeout(&self) -> Duration {
        Duration::from_millis(self.rate_limit_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            flush_timeout_ms: default_flush_timeout_ms(),
            history_on_join: default_history_on_join(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            global_days: default_global_days(),
            sweep_interval_secs: default_retention_sweep_secs(),
            presence_stale_secs: default_presence_stale_secs(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    #[must_use]
    pub fn presence_stale_after(&self) -> Duration {
        Duration::from_secs(self.presence_stale_secs)
    }

    /// Effective retention for a room: the stricter of the room's own
    /// setting and the global ceiling, ignoring zeros.
    #[must_use]
    pub fn effective_days(&self, room_days: u32) -> Option<u32> {
        match (room_days, self.global_days) {
            (0, 0) => None,
            (0, global) => Some(global),
            (room, 0) => Some(room),
            (room, global) => Some(room.min(global)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.admission.max_connections_per_identity, 5);
        assert_eq!(config.admission.max_frame_bytes, 65_536);
        assert_eq!(config.admission.auth_timeout(), Duration::from_secs(2));
        assert_eq!(config.admission.broker_timeout(), Duration::from_secs(1));
        assert_eq!(config.sessions.stale_after(), Duration::from_secs(300));
        assert!(config.admission.allow_anonymous);
    }

    #[test]
    fn test_partial_toml() {
        let config: HubConfig = toml::from_str(
            r#"
            [admission]
            max_connections_per_identity = 2
            limiter = "token_bucket"

            [[rooms]]
            name = "general"
            "#,
        )
        .unwrap();
        assert_eq!(config.admission.max_connections_per_identity, 2);
        assert_eq!(config.admission.limiter, LimiterKind::TokenBucket);
        assert_eq!(config.admission.rules.len(), 2);
        assert_eq!(config.rooms[0].name, "general");
        assert!(config.rooms[0].persistent);
        assert_eq!(config.retention.global_days, 30);
    }

    #[test]
    fn test_effective_retention() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.effective_days(0), Some(30));
        assert_eq!(retention.effective_days(7), Some(7));
        assert_eq!(retention.effective_days(90), Some(30));

        let unbounded = RetentionConfig {
            global_days: 0,
            ..RetentionConfig::default()
        };
        assert_eq!(unbounded.effective_days(0), None);
        assert_eq!(unbounded.effective_days(3), Some(3));
    }
}
