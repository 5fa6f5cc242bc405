//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found (`SWITCHBOARD_CONFIG`, `switchboard.toml`,
//!   `/etc/switchboard/switchboard.toml`, `~/.config/switchboard/switchboard.toml`)
//! - Environment variables (`SWITCHBOARD__PORT`, `SWITCHBOARD__ADMISSION__MAX_FRAME_BYTES`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use switchboard_admission::{InMemoryRevocationList, StaticTokenValidator, UserIdentity};
use switchboard_core::HubConfig;

const CONFIG_PATHS: [&str; 3] = [
    "switchboard.toml",
    "/etc/switchboard/switchboard.toml",
    "~/.config/switchboard/switchboard.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Static tokens and revocations.
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Seconds to wait for sessions to drain on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// `[admission]`, `[sessions]`, `[retention]` and `[[rooms]]`.
    #[serde(flatten)]
    pub hub: HubConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// One static token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,

    /// Tokens that are always rejected, even if listed above.
    #[serde(default)]
    pub revoked: Vec<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn validator(&self) -> StaticTokenValidator {
        let validator = StaticTokenValidator::new();
        for entry in &self.tokens {
            validator.insert(
                entry.token.clone(),
                UserIdentity::new(entry.user_id.clone()).with_groups(entry.groups.iter().cloned()),
            );
        }
        validator
    }

    #[must_use]
    pub fn revocations(&self) -> InMemoryRevocationList {
        let revocations = InMemoryRevocationList::new();
        for token in &self.revoked {
            revocations.revoke(token.clone());
        }
        revocations
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bearer token required on `/admin` routes. Unset leaves them open.
    #[serde(default)]
    pub token: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            hub: HubConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load the first config file found, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = Self::find_file() {
            tracing::info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SWITCHBOARD")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("admission.allowed_origins")
                    .with_list_parse_key("admission.allow_addresses")
                    .with_list_parse_key("auth.revoked"),
            )
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("SWITCHBOARD_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref()));
        }
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
