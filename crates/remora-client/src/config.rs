//! TOML configuration for the client.
//!
//! Every section and field has a default, so a config file only needs
//! to state what it changes.

use std::path::Path;

use remora_net::{FailFast, FailurePolicy, PoolConfig, WindowThrottle};
use remora_topology::WatcherConfig;
use serde::Deserialize;
use tokio::time::Duration;

use crate::error::ClientError;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Topology discovery.
    pub cluster: ClusterSection,
    /// Per-node connection pool sizing.
    pub pool: PoolSection,
    /// Network and resurrection timeouts.
    pub timeouts: TimeoutSection,
    /// Key-to-node resolution strategy.
    pub locator: LocatorSection,
    /// Failure-detection policy.
    pub failure: FailureSection,
}

/// `[cluster]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Streaming discovery URLs, tried in order. Unused by clients
    /// built from a static node list.
    pub bootstrap_urls: Vec<String>,
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Connections opened up front per node.
    pub min: usize,
    /// Hard cap on concurrently checked-out connections per node.
    pub max: usize,
    /// How long an operation queues for a free connection.
    pub queue_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            queue_timeout_ms: 500,
        }
    }
}

/// `[timeouts]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// TCP connect budget.
    pub connect_ms: u64,
    /// Per-read budget while waiting for a response.
    pub receive_ms: u64,
    /// Resurrection probe period, and how long topology discovery
    /// sleeps when every bootstrap URL is down.
    pub dead_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            receive_ms: 2_000,
            dead_ms: 10_000,
        }
    }
}

/// `[locator]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocatorSection {
    /// `"vbucket"` to route through the cluster's vbucket map when one
    /// is published, `"ketama"` to always use the consistent-hash ring.
    pub kind: String,
}

impl Default for LocatorSection {
    fn default() -> Self {
        Self {
            kind: "vbucket".to_string(),
        }
    }
}

/// `[failure]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailureSection {
    /// `"fail_fast"` to mark a node dead on its first failure,
    /// `"throttle"` to require `max_failures` within `window_ms`.
    pub policy: String,
    /// Failures inside the window that trip a `"throttle"` policy.
    pub max_failures: usize,
    /// Sliding window for the `"throttle"` policy.
    pub window_ms: u64,
}

impl Default for FailureSection {
    fn default() -> Self {
        Self {
            policy: "throttle".to_string(),
            max_failures: 3,
            window_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ClientError> {
        Ok(toml::from_str(s)?)
    }

    /// The per-node pool configuration this config describes.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min: self.pool.min,
            max: self.pool.max,
            queue_timeout: Duration::from_millis(self.pool.queue_timeout_ms),
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            receive_timeout: Duration::from_millis(self.timeouts.receive_ms),
        }
    }

    /// A fresh failure-policy instance for one node.
    pub fn failure_policy(&self) -> Box<dyn FailurePolicy> {
        match self.failure.policy.as_str() {
            "fail_fast" => Box::new(FailFast),
            _ => Box::new(WindowThrottle::new(
                self.failure.max_failures,
                Duration::from_millis(self.failure.window_ms),
            )),
        }
    }

    /// Topology-watcher configuration for the bootstrap URL list.
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            bootstrap_urls: self.cluster.bootstrap_urls.clone(),
            dead_timeout: self.dead_timeout(),
            ..WatcherConfig::default()
        }
    }

    /// The resurrection/retry period.
    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.dead_ms)
    }

    /// Whether the vbucket map should be used when the cluster
    /// publishes one.
    pub fn prefers_vbucket(&self) -> bool {
        self.locator.kind != "ketama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[cluster]
bootstrap_urls = ["http://10.0.0.1:8091/pools/default/bucketsStreaming/default"]

[pool]
min = 2
max = 16
queue_timeout_ms = 250

[timeouts]
connect_ms = 1000
receive_ms = 500
dead_ms = 5000

[locator]
kind = "ketama"

[failure]
policy = "fail_fast"
"#;
        let config = ClientConfig::from_toml(toml).unwrap();
        assert_eq!(config.cluster.bootstrap_urls.len(), 1);
        assert_eq!(config.pool.min, 2);
        assert_eq!(config.pool.max, 16);
        assert!(!config.prefers_vbucket());

        let pool = config.pool_config();
        assert_eq!(pool.queue_timeout, Duration::from_millis(250));
        assert_eq!(pool.connect_timeout, Duration::from_secs(1));
        assert_eq!(pool.receive_timeout, Duration::from_millis(500));
        assert_eq!(config.dead_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_config_gets_defaults() {
        let config = ClientConfig::from_toml("").unwrap();
        assert!(config.cluster.bootstrap_urls.is_empty());
        assert_eq!(config.pool.max, 8);
        assert_eq!(config.timeouts.dead_ms, 10_000);
        assert!(config.prefers_vbucket());
        assert_eq!(config.failure.policy, "throttle");
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let config = ClientConfig::from_toml("[pool]\nmax = 2\n").unwrap();
        assert_eq!(config.pool.max, 2);
        assert_eq!(config.pool.min, 1);
        assert_eq!(config.timeouts.receive_ms, 2_000);
    }

    #[test]
    fn test_failure_policy_selection() {
        let fast = ClientConfig::from_toml("[failure]\npolicy = \"fail_fast\"\n").unwrap();
        // FailFast trips on the first failure.
        assert!(fast.failure_policy().record_failure());

        let throttle = ClientConfig::from_toml("[failure]\nmax_failures = 2\n").unwrap();
        let policy = throttle.failure_policy();
        assert!(!policy.record_failure());
        assert!(policy.record_failure());
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        assert!(matches!(
            ClientConfig::from_toml("[pool]\nmax = \"lots\"\n"),
            Err(ClientError::ConfigParse(_))
        ));
    }
}
