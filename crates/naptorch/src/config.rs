//! Configuration file support for naptorch.
//!
//! Loads and validates the daemon configuration from a YAML document.
//! Every key is optional; missing keys take the defaults below.
//!
//! ```yaml
//! translation:
//!   mode: conntrack
//!   group_wait_timeout_ms: 2000
//! pools:
//!   port_range: { low: 49152, high: 65535 }
//! queue:
//!   max_attempts: 5
//! daemon:
//!   reconcile_interval_ms: 60000
//! ```

use napt_orch_common::RetryPolicy;
use napt_types::Vni;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Translation mode for networks that are not cross-domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationModeConfig {
    /// Per-session field rewrite rules installed on first packet
    #[default]
    Controller,
    /// Per-connection state kept by the dataplane connection tracker
    Conntrack,
}

/// Inclusive integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub low: u32,
    pub high: u32,
}

impl RangeConfig {
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.low..=self.high).contains(&value)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.low > self.high {
            return Err(ConfigError::Invalid(format!(
                "{name}: low {} exceeds high {}",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub mode: TranslationModeConfig,

    /// How long a rule waits for the redirection group it forwards to
    #[serde(default = "default_group_wait_timeout")]
    pub group_wait_timeout_ms: u64,

    /// Idle timeout of per-session rules in seconds
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_port_range")]
    pub port_range: RangeConfig,

    #[serde(default = "default_vni_range")]
    pub vni_range: RangeConfig,

    /// Labels for route advertisement outside the cross-domain mode
    #[serde(default = "default_label_range")]
    pub label_range: RangeConfig,

    #[serde(default = "default_group_id_range")]
    pub group_id_range: RangeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total attempts per queued work item
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// Router-keyed items running at once
    #[serde(default = "default_router_workers")]
    pub router_workers: usize,

    /// Node-keyed items running at once
    #[serde(default = "default_node_workers")]
    pub node_workers: usize,

    /// First-packet events handled at once
    #[serde(default = "default_packet_workers")]
    pub packet_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Depth of the daemon's event channel
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,

    /// Periodic reconciliation sweep; disabled when absent
    #[serde(default)]
    pub reconcile_interval_ms: Option<u64>,
}

/// Complete naptorch configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NaptConfig {
    #[serde(default)]
    pub translation: TranslationConfig,

    #[serde(default)]
    pub pools: PoolConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

fn default_group_wait_timeout() -> u64 {
    5000
}

fn default_session_idle_timeout() -> u32 {
    300
}

fn default_port_range() -> RangeConfig {
    RangeConfig::new(49152, 65535)
}

fn default_vni_range() -> RangeConfig {
    RangeConfig::new(70000, 99999)
}

fn default_label_range() -> RangeConfig {
    RangeConfig::new(100_000, 200_000)
}

fn default_group_id_range() -> RangeConfig {
    RangeConfig::new(150_000, 175_000)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    200
}

fn default_router_workers() -> usize {
    16
}

fn default_node_workers() -> usize {
    4
}

fn default_packet_workers() -> usize {
    32
}

/// Upper bound on concurrent first-packet tasks.
pub const MAX_PACKET_WORKERS: usize = 65_536;

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_event_queue_depth() -> usize {
    1024
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            mode: TranslationModeConfig::default(),
            group_wait_timeout_ms: default_group_wait_timeout(),
            session_idle_timeout_secs: default_session_idle_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_range: default_port_range(),
            vni_range: default_vni_range(),
            label_range: default_label_range(),
            group_id_range: default_group_id_range(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            router_workers: default_router_workers(),
            node_workers: default_node_workers(),
            packet_workers: default_packet_workers(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            event_queue_depth: default_event_queue_depth(),
            reconcile_interval_ms: None,
        }
    }
}

impl NaptConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the configuration file at `path`.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pools = &self.pools;
        pools.port_range.validate("port_range")?;
        pools.vni_range.validate("vni_range")?;
        pools.label_range.validate("label_range")?;
        pools.group_id_range.validate("group_id_range")?;

        if pools.port_range.low == 0 || pools.port_range.high > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid(
                "port_range must lie within 1-65535".to_string(),
            ));
        }
        if pools.vni_range.high > Vni::MAX {
            return Err(ConfigError::Invalid(format!(
                "vni_range high {} exceeds 24 bits",
                pools.vni_range.high
            )));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".to_string()));
        }
        if self.queue.router_workers == 0
            || self.queue.node_workers == 0
            || self.queue.packet_workers == 0
        {
            return Err(ConfigError::Invalid("worker counts must be > 0".to_string()));
        }
        if self.queue.packet_workers > MAX_PACKET_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "packet_workers must be at most {MAX_PACKET_WORKERS}"
            )));
        }
        if self.daemon.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.daemon.reconcile_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "reconcile_interval_ms must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn group_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.translation.group_wait_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.queue.max_attempts,
            Duration::from_millis(self.queue.backoff_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.heartbeat_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.daemon.reconcile_interval_ms.map(Duration::from_millis)
    }
}
