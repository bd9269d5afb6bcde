//! Configuration types for ipmsg-node.
//! Parsed from ~/.ipmsg/config.toml.

use ipmsg_protocol::{ProtocolParams, DEFAULT_PARAMS, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub recall: RecallSection,
    #[serde(default)]
    pub typing: TypingSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub transfer: TransferSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Display name announced to peers. Defaults to the login name.
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Hostname announced to peers. Defaults to the machine hostname.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    pub group: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            hostname: default_hostname(),
            group: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Subnet broadcast addresses. Empty means 255.255.255.255 only.
    #[serde(default)]
    pub broadcast_addrs: Vec<Ipv4Addr>,
    #[serde(default = "default_port")]
    pub tcp_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast_addrs: Vec::new(),
            tcp_port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub low_power: bool,
    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval_secs: u64,
    #[serde(default = "default_miss_limit")]
    pub miss_limit: u32,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_PARAMS.heartbeat_interval_secs,
            low_power: false,
            timeout_check_interval_secs: DEFAULT_PARAMS.timeout_check_interval_secs,
            miss_limit: DEFAULT_PARAMS.heartbeat_miss_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallSection {
    #[serde(default = "default_recall_window")]
    pub window_secs: u64,
    #[serde(default = "default_recall_retention")]
    pub retention_hours: u64,
}

impl Default for RecallSection {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_PARAMS.recall_window_secs,
            retention_hours: DEFAULT_PARAMS.recall_retention_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingSection {
    #[serde(default = "default_typing_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_typing_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_typing_cleanup")]
    pub cleanup_interval_ms: u64,
}

impl Default for TypingSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PARAMS.typing_timeout_ms,
            debounce_ms: DEFAULT_PARAMS.typing_debounce_ms,
            cleanup_interval_ms: DEFAULT_PARAMS.typing_cleanup_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_PARAMS.max_retries,
            base_delay_ms: DEFAULT_PARAMS.retry_base_delay_ms,
            connect_timeout_secs: DEFAULT_PARAMS.connect_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_PARAMS.block_size,
        }
    }
}

// Default value functions
fn default_nickname() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "ipmsg".into())
}
fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_PARAMS.heartbeat_interval_secs
}
fn default_timeout_check_interval() -> u64 {
    DEFAULT_PARAMS.timeout_check_interval_secs
}
fn default_miss_limit() -> u32 {
    DEFAULT_PARAMS.heartbeat_miss_limit
}
fn default_recall_window() -> u64 {
    DEFAULT_PARAMS.recall_window_secs
}
fn default_recall_retention() -> u64 {
    DEFAULT_PARAMS.recall_retention_hours
}
fn default_typing_timeout() -> u64 {
    DEFAULT_PARAMS.typing_timeout_ms
}
fn default_typing_debounce() -> u64 {
    DEFAULT_PARAMS.typing_debounce_ms
}
fn default_typing_cleanup() -> u64 {
    DEFAULT_PARAMS.typing_cleanup_interval_ms
}
fn default_max_retries() -> u32 {
    DEFAULT_PARAMS.max_retries
}
fn default_base_delay() -> u64 {
    DEFAULT_PARAMS.retry_base_delay_ms
}
fn default_connect_timeout() -> u64 {
    DEFAULT_PARAMS.connect_timeout_secs
}
fn default_block_size() -> usize {
    DEFAULT_PARAMS.block_size
}

/// Upper bound for `[delivery] max_retries`.
pub const MAX_DELIVERY_RETRIES: u32 = 16;

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.delivery.max_retries <= MAX_DELIVERY_RETRIES,
            "delivery.max_retries must be at most {MAX_DELIVERY_RETRIES}, got {}",
            self.delivery.max_retries
        );
        Ok(())
    }

    /// Protocol parameters with config overrides applied.
    pub fn params(&self) -> ProtocolParams {
        let mut p = DEFAULT_PARAMS;
        p.heartbeat_interval_secs = self.presence.heartbeat_interval_secs;
        p.low_power_heartbeat_interval_secs = self.presence.heartbeat_interval_secs * 2;
        p.timeout_check_interval_secs = self.presence.timeout_check_interval_secs;
        p.heartbeat_miss_limit = self.presence.miss_limit;
        p.recall_window_secs = self.recall.window_secs;
        p.recall_retention_hours = self.recall.retention_hours;
        p.typing_timeout_ms = self.typing.timeout_ms;
        p.typing_debounce_ms = self.typing.debounce_ms;
        p.typing_cleanup_interval_ms = self.typing.cleanup_interval_ms;
        p.max_retries = self.delivery.max_retries;
        p.retry_base_delay_ms = self.delivery.base_delay_ms;
        p.connect_timeout_secs = self.delivery.connect_timeout_secs;
        p.block_size = self.transfer.block_size;
        p
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.params().heartbeat_interval(self.presence.low_power))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.params().heartbeat_timeout(self.presence.low_power))
    }
}
