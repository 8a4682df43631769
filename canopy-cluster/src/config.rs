//! Cluster configuration

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Declared cluster name, unique among siblings
    #[serde(default = "default_name")]
    pub name: String,

    /// User-visible name sent to the parent at registration
    #[serde(default)]
    pub display_name: Option<String>,

    /// Address to bind the child-link listener
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address announced to the parent as our listen address; defaults to
    /// the bound listener address
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Listen address of the parent; `None` makes this node the root
    #[serde(default)]
    pub parent_addr: Option<String>,

    /// Optional listener for a single controller link
    #[serde(default)]
    pub controller_addr: Option<String>,

    /// Namespace used for persisted records at the root
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Dial timeout for the parent link in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Link write deadline in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Link read deadline in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Keepalive ping interval in milliseconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Capacity of each link's outbound queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Delay between reconnect attempts against the same parent
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Minimum age of a failed parent address before it is retried
    #[serde(default = "default_failover_cooldown")]
    pub failover_cooldown_ms: u64,

    /// Optimistic retries when merging response statuses into a record
    #[serde(default = "default_merge_retries")]
    pub merge_retries: usize,

    /// Grace period for in-flight writes at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_name() -> String {
    format!("cluster-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn default_listen_addr() -> String {
    "0.0.0.0:9443".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_read_timeout() -> u64 {
    60_000
}

fn default_ping_interval() -> u64 {
    20_000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_reconnect_backoff() -> u64 {
    5_000
}

fn default_failover_cooldown() -> u64 {
    30_000
}

fn default_merge_retries() -> usize {
    5
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            display_name: None,
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            parent_addr: None,
            controller_addr: None,
            namespace: default_namespace(),
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
            read_timeout_ms: default_read_timeout(),
            ping_interval_ms: default_ping_interval(),
            outbound_queue: default_outbound_queue(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            failover_cooldown_ms: default_failover_cooldown(),
            merge_retries: default_merge_retries(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl ClusterConfig {
    /// Configuration for a named node, everything else defaulted
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A node without a parent is the root of the tree
    pub fn is_root(&self) -> bool {
        self.parent_addr.is_none()
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Reject configurations the node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ClusterError::Config("cluster name must not be empty".into()));
        }
        if self.name.contains(',') || self.name.contains('/') {
            return Err(ClusterError::Config(format!(
                "cluster name '{}' must not contain ',' or '/'",
                self.name
            )));
        }
        self.listen_addr.parse::<std::net::SocketAddr>().map_err(|e| {
            ClusterError::Config(format!("Invalid listen address '{}': {}", self.listen_addr, e))
        })?;
        if let Some(addr) = &self.controller_addr {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                ClusterError::Config(format!("Invalid controller address '{}': {}", addr, e))
            })?;
        }
        if matches!(self.parent_addr.as_deref(), Some(p) if p.trim().is_empty()) {
            return Err(ClusterError::Config("parent address must not be empty".into()));
        }
        if self.outbound_queue == 0 {
            return Err(ClusterError::Config("outbound_queue must be positive".into()));
        }
        if self.ping_interval_ms == 0 {
            return Err(ClusterError::Config("ping_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn failover_cooldown(&self) -> Duration {
        Duration::from_millis(self.failover_cooldown_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
