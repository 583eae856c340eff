//! Wolfpack Configuration
//!
//! Configuration structures for the cluster membership and replica
//! placement core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::gossip::{FailureDetectorConfig, GossipSettings, GOSSIP_INTERVAL_MS};
use crate::topology::DynamicSnitchConfig;

/// Main wolfpack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfpackConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster membership configuration
    pub cluster: ClusterConfig,

    /// Failure detector configuration
    #[serde(default)]
    pub failure_detector: FdConfig,

    /// Dynamic snitch configuration
    #[serde(default)]
    pub snitch: SnitchConfig,

    /// Replication strategy configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind for gossip communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Stable host id surviving address changes
    #[serde(default)]
    pub host_id: Option<String>,

    /// Internal address advertised to same-datacenter peers
    #[serde(default)]
    pub internal_address: Option<String>,

    /// Data directory (preferred-address book)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; gossip from other clusters is dropped
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Seed node addresses used as rendezvous points
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Datacenter this node lives in
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Rack this node lives in
    #[serde(default = "default_rack")]
    pub rack: String,

    /// Reconnect to same-datacenter peers over their internal address
    #[serde(default)]
    pub prefer_local: bool,

    /// Gossip tick period in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Upper bound on convergence after a topology change
    #[serde(default = "default_ring_delay_ms")]
    pub ring_delay_ms: u64,
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FdConfig {
    /// Conviction threshold; 8.0 suits most networks
    #[serde(default = "default_phi_convict_threshold")]
    pub phi_convict_threshold: f64,

    /// Seed interval for empty arrival windows (default 2 x gossip period)
    #[serde(default)]
    pub initial_value_ms: Option<u64>,

    /// Longest interval admitted into a window (default = initial value)
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

/// Dynamic snitch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnitchConfig {
    /// Score map rebuild period in milliseconds
    #[serde(default = "default_dynamic_update_interval_ms")]
    pub dynamic_update_interval_ms: u64,

    /// Full latency-sample reset period in milliseconds
    #[serde(default = "default_dynamic_reset_interval_ms")]
    pub dynamic_reset_interval_ms: u64,

    /// 0 sorts purely by score; otherwise static order survives until an
    /// endpoint is worse than its sorted counterpart by this factor
    #[serde(default = "default_dynamic_badness_threshold")]
    pub dynamic_badness_threshold: f64,
}

/// Replication strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// "network-topology" or "local"
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Datacenter name -> replication factor (network-topology only)
    #[serde(default)]
    pub factors: HashMap<String, u32>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfpack")
}

fn default_cluster_name() -> String {
    "wolfpack".to_string()
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_rack() -> String {
    "rack1".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    GOSSIP_INTERVAL_MS
}

fn default_ring_delay_ms() -> u64 {
    30_000
}

fn default_phi_convict_threshold() -> f64 {
    8.0
}

fn default_dynamic_update_interval_ms() -> u64 {
    100
}

fn default_dynamic_reset_interval_ms() -> u64 {
    600_000
}

fn default_dynamic_badness_threshold() -> f64 {
    0.1
}

fn default_strategy() -> String {
    "network-topology".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            phi_convict_threshold: default_phi_convict_threshold(),
            initial_value_ms: None,
            max_interval_ms: None,
        }
    }
}

impl Default for SnitchConfig {
    fn default() -> Self {
        Self {
            dynamic_update_interval_ms: default_dynamic_update_interval_ms(),
            dynamic_reset_interval_ms: default_dynamic_reset_interval_ms(),
            dynamic_badness_threshold: default_dynamic_badness_threshold(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            factors: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfpackConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfpackConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }
        Endpoint::parse(self.advertised_address())?;
        for seed in &self.cluster.seeds {
            Endpoint::parse(seed)?;
        }
        if self.cluster.name.is_empty() {
            return Err(crate::Error::Config("cluster.name cannot be empty".into()));
        }
        if self.cluster.gossip_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.gossip_interval_ms must be positive".into(),
            ));
        }
        if self.snitch.dynamic_badness_threshold < 0.0 {
            return Err(crate::Error::Config(
                "snitch.dynamic_badness_threshold cannot be negative".into(),
            ));
        }
        match self.replication.strategy.as_str() {
            "local" => {}
            "network-topology" => {
                if self.replication.factors.contains_key("replication_factor") {
                    return Err(crate::Error::Config(
                        "replication_factor is not a datacenter name".into(),
                    ));
                }
            }
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown replication strategy {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// The address peers should use to reach this node
    pub fn advertised_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// The local endpoint identity
    pub fn local_endpoint(&self) -> crate::Result<Endpoint> {
        let mut endpoint = Endpoint::parse(self.advertised_address())?;
        endpoint.host_id = self.node.host_id.clone();
        Ok(endpoint)
    }

    /// Seed endpoints
    pub fn seed_endpoints(&self) -> crate::Result<Vec<Endpoint>> {
        self.cluster.seeds.iter().map(|s| Endpoint::parse(s)).collect()
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.gossip_interval_ms)
    }

    pub fn ring_delay(&self) -> Duration {
        Duration::from_millis(self.cluster.ring_delay_ms)
    }

    pub fn gossip_settings(&self) -> GossipSettings {
        GossipSettings {
            cluster_name: self.cluster.name.clone(),
            interval: self.gossip_interval(),
            ring_delay: self.ring_delay(),
        }
    }

    pub fn failure_detector_config(&self) -> FailureDetectorConfig {
        let initial_ms = self
            .failure_detector
            .initial_value_ms
            .unwrap_or(self.cluster.gossip_interval_ms * 2);
        let max_ms = self.failure_detector.max_interval_ms.unwrap_or(initial_ms);
        FailureDetectorConfig {
            initial_value_nanos: initial_ms * 1_000_000,
            max_interval_nanos: max_ms * 1_000_000,
            phi_convict_threshold: self.failure_detector.phi_convict_threshold,
        }
    }

    pub fn dynamic_snitch_config(&self) -> DynamicSnitchConfig {
        DynamicSnitchConfig {
            update_interval: Duration::from_millis(self.snitch.dynamic_update_interval_ms),
            reset_interval: Duration::from_millis(self.snitch.dynamic_reset_interval_ms),
            badness_threshold: self.snitch.dynamic_badness_threshold,
        }
    }

    /// Path of the persisted preferred-address book
    pub fn preferred_address_path(&self) -> PathBuf {
        self.node.data_dir.join("preferred-addresses.toml")
    }

    /// A commented starter configuration for `init`
    pub fn example(bind_address: &str) -> String {
        format!(
            r#"[node]
bind_address = "{bind}"
# advertise_address = "203.0.113.7:7946"
# host_id = "wolf-1"
data_dir = "/var/lib/wolfpack"

[cluster]
name = "wolfpack"
seeds = ["{bind}"]
datacenter = "dc1"
rack = "rack1"
# prefer_local = true

[failure_detector]
phi_convict_threshold = 8.0

[snitch]
dynamic_update_interval_ms = 100
dynamic_reset_interval_ms = 600000
dynamic_badness_threshold = 0.1

[replication]
strategy = "network-topology"

[replication.factors]
dc1 = 3

[logging]
level = "info"
format = "pretty"
"#,
            bind = bind_address
        )
    }
}
