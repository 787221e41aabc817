//! Configuration management for swarmguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SwarmGuardError};

/// Prefix for environment variable overrides, e.g. `SWARMGUARD__CLUSTER__ENABLED=true`.
const ENV_PREFIX: &str = "SWARMGUARD";

/// Main configuration for the rate limiting engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmGuardConfig {
    /// Nominal limit configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Behavior profiling configuration
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Cluster coordination configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Nominal limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum attempts admitted per window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Optional YAML file with custom rules, added on top of the defaults
    #[serde(default)]
    pub rules_path: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            rules_path: None,
        }
    }
}

fn default_max_attempts() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

/// Behavior profiling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Enables the secondary statistical adjustment pass
    #[serde(default)]
    pub advanced_analysis: bool,

    /// Lifetime of a behavior profile in seconds
    #[serde(default = "default_profile_ttl")]
    pub profile_ttl_secs: u64,

    /// Retention of anomaly score snapshots in seconds
    #[serde(default = "default_score_history_ttl")]
    pub score_history_ttl_secs: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            advanced_analysis: false,
            profile_ttl_secs: default_profile_ttl(),
            score_history_ttl_secs: default_score_history_ttl(),
        }
    }
}

fn default_profile_ttl() -> u64 {
    86_400
}

fn default_score_history_ttl() -> u64 {
    7 * 86_400
}

/// Cluster coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether limiters attach a coordinator and publish their local counts to it
    #[serde(default)]
    pub enabled: bool,

    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Hostname advertised in the node record
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// IP address advertised in the node record
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Nodes not seen for this many seconds are purged by the primary
    #[serde(default = "default_max_node_age")]
    pub max_node_age_secs: u64,

    /// TTL of key-scoped coordinator locks
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// TTL of the election lock
    #[serde(default = "default_election_lock_ttl")]
    pub election_lock_ttl_secs: u64,

    /// Interval between heartbeat/maintenance rounds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Gossip transport for cross-node notifications; absent means in-process only
    #[serde(default)]
    pub gossip: Option<GossipConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: default_node_id(),
            hostname: default_hostname(),
            ip: default_ip(),
            max_node_age_secs: default_max_node_age(),
            lock_ttl_secs: default_lock_ttl(),
            election_lock_ttl_secs: default_election_lock_ttl(),
            maintenance_interval_secs: default_maintenance_interval(),
            gossip: None,
        }
    }
}

impl ClusterConfig {
    /// Interval between maintenance rounds as a [`Duration`].
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_max_node_age() -> u64 {
    300
}

fn default_lock_ttl() -> u64 {
    3
}

fn default_election_lock_ttl() -> u64 {
    5
}

fn default_maintenance_interval() -> u64 {
    30
}

/// Gossip transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// The address to listen on for gossip
    pub listen_addr: SocketAddr,

    /// The address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers sharing this identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip round interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state is deleted
    #[serde(default = "default_dead_node_grace")]
    pub dead_node_grace_period_secs: u64,
}

fn default_cluster_id() -> String {
    "swarmguard".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace() -> u64 {
    3600
}

impl SwarmGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SwarmGuardConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: an optional file, then `SWARMGUARD__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: SwarmGuardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SwarmGuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.max_attempts == 0 {
            return Err(SwarmGuardError::Config(
                "limiter.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.limiter.window_secs == 0 {
            return Err(SwarmGuardError::Config(
                "limiter.window_secs must be at least 1".to_string(),
            ));
        }
        if self.cluster.node_id.is_empty() {
            return Err(SwarmGuardError::Config(
                "cluster.node_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SwarmGuardConfig::default();
        assert_eq!(config.limiter.max_attempts, 60);
        assert_eq!(config.limiter.window_secs, 60);
        assert!(!config.behavior.advanced_analysis);
        assert_eq!(config.behavior.profile_ttl_secs, 86_400);
        assert_eq!(config.cluster.max_node_age_secs, 300);
        assert!(config.cluster.gossip.is_none());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  max_attempts: 5
behavior:
  advanced_analysis: true
cluster:
  enabled: true
  node_id: node-a
"#;
        let config = SwarmGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.max_attempts, 5);
        assert_eq!(config.limiter.window_secs, 60);
        assert!(config.behavior.advanced_analysis);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.node_id, "node-a");
        assert_eq!(config.cluster.lock_ttl_secs, 3);
    }

    #[test]
    fn test_parse_gossip_section() {
        let yaml = r#"
cluster:
  gossip:
    listen_addr: "127.0.0.1:7946"
    seed_nodes: ["127.0.0.1:7947"]
"#;
        let config = SwarmGuardConfig::from_yaml(yaml).unwrap();
        let gossip = config.cluster.gossip.unwrap();
        assert_eq!(gossip.cluster_id, "swarmguard");
        assert_eq!(gossip.gossip_interval_ms, 100);
        assert_eq!(gossip.seed_nodes.len(), 1);
        assert!(gossip.advertise_addr.is_none());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = "limiter:\n  max_attempts: 0\n";
        let err = SwarmGuardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, SwarmGuardError::Config(_)));
    }
}
