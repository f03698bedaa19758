// src/config.rs

//! Loads and validates the watchdog's TOML configuration file.
//!
//! The core never touches the on-disk format beyond this module; everything
//! downstream consumes the already-parsed [`WatchdogConfig`].

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::time::Duration;

/// Static configuration for one peer node (or the local node) in the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub hostname: String,
    pub wd_port: u16,
    pub pool_port: u16,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub delegate_ip: Option<String>,
}

fn default_priority() -> i32 {
    1
}

/// Quorum-related knobs (spec §4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct QuorumConfig {
    #[serde(default)]
    pub enable_consensus_with_half_votes: bool,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            enable_consensus_with_half_votes: false,
        }
    }
}

/// Failover-consensus knobs (spec §4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub failover_when_quorum_exists: bool,
    #[serde(default)]
    pub allow_multiple_failover_requests_from_node: bool,
    #[serde(with = "humantime_serde", default = "default_health_check_period")]
    pub health_check_period: Duration,
    #[serde(default = "default_health_check_retries")]
    pub health_check_retries: u32,
    #[serde(with = "humantime_serde", default = "default_health_check_retry_delay")]
    pub health_check_retry_delay: Duration,
}

fn default_true() -> bool {
    true
}
fn default_health_check_period() -> Duration {
    Duration::from_secs(10)
}
fn default_health_check_retries() -> u32 {
    3
}
fn default_health_check_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failover_when_quorum_exists: default_true(),
            allow_multiple_failover_requests_from_node: false,
            health_check_period: default_health_check_period(),
            health_check_retries: default_health_check_retries(),
            health_check_retry_delay: default_health_check_retry_delay(),
        }
    }
}

/// Membership revocation timeouts (spec §4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default)]
    pub wd_remove_shutdown_nodes: bool,
    #[serde(
        with = "humantime_serde",
        default = "default_no_show_removal_timeout"
    )]
    pub wd_no_show_node_removal_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_lost_removal_timeout")]
    pub wd_lost_node_removal_timeout: Duration,
}

fn default_no_show_removal_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_lost_removal_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            wd_remove_shutdown_nodes: false,
            wd_no_show_node_removal_timeout: default_no_show_removal_timeout(),
            wd_lost_node_removal_timeout: default_lost_removal_timeout(),
        }
    }
}

/// Opaque external helper invocations for VIP acquisition/release (spec §4.8).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscalationConfig {
    /// Shell command spawned to bring the delegate IP up on this host.
    pub escalation_command: Option<String>,
    /// Shell command spawned to tear the delegate IP back down.
    pub de_escalation_command: Option<String>,
}

/// Top-level watchdog configuration, as loaded from `watchdog.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Index into `nodes` identifying which entry is "us".
    pub local_node_id: usize,
    pub nodes: Vec<NodeConfig>,

    /// Shared secret used to authenticate `ADD_NODE` and internal-only IPC
    /// requests. `None` disables authentication.
    pub auth_key: Option<String>,

    #[serde(default = "default_ipc_socket_dir")]
    pub ipc_socket_dir: String,
    #[serde(default)]
    pub ipc_auth_required: bool,

    #[serde(with = "humantime_serde", default = "default_reply_timeout")]
    pub reply_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_beacon_interval")]
    pub beacon_interval: Duration,
    #[serde(default = "default_beacon_miss_threshold")]
    pub beacon_miss_threshold: u32,

    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_ipc_socket_dir() -> String {
    "/tmp".to_string()
}
fn default_reply_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_beacon_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_beacon_miss_threshold() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl WatchdogConfig {
    /// Reads and parses a TOML config file from disk, then validates it.
    pub async fn from_file(path: &str) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: WatchdogConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow!("at least one node must be configured"));
        }
        if self.local_node_id >= self.nodes.len() {
            return Err(anyhow!(
                "local_node_id {} is out of range for {} configured nodes",
                self.local_node_id,
                self.nodes.len()
            ));
        }
        if self.beacon_miss_threshold == 0 {
            return Err(anyhow!("beacon_miss_threshold must be at least 1"));
        }
        Ok(())
    }

    pub fn local(&self) -> &NodeConfig {
        &self.nodes[self.local_node_id]
    }

    /// Every configured node other than the local one, paired with its `node_id`.
    pub fn remotes(&self) -> impl Iterator<Item = (usize, &NodeConfig)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(id, _)| *id != self.local_node_id)
    }

    /// Timeout after which an outstanding failover object expires, derived
    /// from health-check parameters per spec §4.4, floored at 15 seconds.
    pub fn failover_command_timeout(&self) -> Duration {
        let per_node = self.failover.health_check_period
            + self.failover.health_check_retry_delay * self.failover.health_check_retries;
        per_node.max(Duration::from_secs(15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_out_of_range_local_node_id() {
        let toml = r#"
            local_node_id = 3
            [[nodes]]
            name = "a"
            hostname = "127.0.0.1"
            wd_port = 9000
            pool_port = 9999
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wd.toml");
        tokio::fs::write(&path, toml).await.unwrap();
        let err = WatchdogConfig::from_file(path.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn failover_command_timeout_is_floored() {
        let toml = r#"
            local_node_id = 0
            [[nodes]]
            name = "a"
            hostname = "127.0.0.1"
            wd_port = 9000
            pool_port = 9999
            [failover]
            health_check_period = "1s"
            health_check_retries = 1
            health_check_retry_delay = "1s"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wd.toml");
        tokio::fs::write(&path, toml).await.unwrap();
        let config = WatchdogConfig::from_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.failover_command_timeout(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn remotes_excludes_local_node() {
        let toml = r#"
            local_node_id = 1
            [[nodes]]
            name = "a"
            hostname = "127.0.0.1"
            wd_port = 9000
            pool_port = 9999
            [[nodes]]
            name = "b"
            hostname = "127.0.0.2"
            wd_port = 9000
            pool_port = 9999
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wd.toml");
        tokio::fs::write(&path, toml).await.unwrap();
        let config = WatchdogConfig::from_file(path.to_str().unwrap())
            .await
            .unwrap();
        let ids: Vec<usize> = config.remotes().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0]);
    }
}
