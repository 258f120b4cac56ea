//! Configuration for elohim-link

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LinkError;
use crate::progress::OperationKind;

/// Default config directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-link")
}

/// Automatic reconnection policy of the WebSocket transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect after an unintentional drop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First backoff delay in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_reconnect_delay_max_ms")]
    pub delay_max_ms: u64,

    /// Maximum consecutive attempts (0 = unlimited)
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay_ms(),
            delay_max_ms: default_reconnect_delay_max_ms(),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before the given attempt (1-based), doubling up to the ceiling
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.delay_max_ms.max(self.delay_ms)))
    }
}

/// A tracked operation kind as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Kind name, also the cache key suffix (`progress:<name>`)
    pub name: String,

    /// Channel name; defaults to `<name>Progress`
    #[serde(default)]
    pub channel: Option<String>,

    /// The two stage tags, in (A, B) order
    pub stages: [String; 2],
}

impl From<&OperationConfig> for OperationKind {
    fn from(op: &OperationConfig) -> Self {
        let [stage_a, stage_b] = op.stages.clone();
        let kind = OperationKind::new(op.name.clone(), stage_a, stage_b);
        match &op.channel {
            Some(channel) => kind.with_channel(channel.clone()),
            None => kind,
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// WebSocket endpoint of the node
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Session cookie sent on the handshake (credential-carrying mode)
    #[serde(default)]
    pub session_cookie: Option<String>,

    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Capacity of each cache slot's change channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Tracked operation kinds
    #[serde(default = "default_operations")]
    pub operations: Vec<OperationConfig>,
}

fn default_endpoint() -> String {
    "ws://localhost:8090/events".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_reconnect_delay_max_ms() -> u64 {
    5000
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_ping_interval_secs() -> u64 {
    25
}

fn default_channel_capacity() -> usize {
    256
}

fn default_operations() -> Vec<OperationConfig> {
    [OperationKind::backup(), OperationKind::restore()]
        .iter()
        .map(|kind| OperationConfig {
            name: kind.name().to_string(),
            channel: None,
            stages: [kind.stage_a().to_string(), kind.stage_b().to_string()],
        })
        .collect()
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            session_cookie: None,
            reconnect: ReconnectConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            channel_capacity: default_channel_capacity(),
            operations: default_operations(),
        }
    }
}

impl LinkConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LinkError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> PathBuf {
        default_config_dir().join("config.toml")
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), LinkError> {
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(LinkError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if self.channel_capacity == 0 {
            return Err(LinkError::Config("channel_capacity must be > 0".into()));
        }

        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        for kind in self.operation_kinds() {
            if kind.stage_a() == kind.stage_b() {
                return Err(LinkError::Config(format!(
                    "operation {} has identical stage tags",
                    kind.name()
                )));
            }
            if !names.insert(kind.name().to_string()) {
                return Err(LinkError::Config(format!(
                    "duplicate operation name: {}",
                    kind.name()
                )));
            }
            if !channels.insert(kind.channel().to_string()) {
                return Err(LinkError::Config(format!(
                    "duplicate progress channel: {}",
                    kind.channel()
                )));
            }
        }
        Ok(())
    }

    /// Operation kinds in config order
    pub fn operation_kinds(&self) -> Vec<OperationKind> {
        self.operations.iter().map(OperationKind::from).collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}
