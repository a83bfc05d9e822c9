//! Configuration module for the CPN controller

use cpn_types::{Dpid, MacAddr, PathMetric, ServiceId, TransportProtocol};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller ID
    pub controller_id: String,

    /// Fabric bridge listener
    pub network: NetworkConfig,

    /// Topology discovery and path computation
    pub topology: TopologyConfig,

    /// Link-weight providers
    pub monitor: MonitorConfig,

    /// Flow rule timeouts and priorities
    pub flow: FlowConfig,

    /// Anycast services and ingress switches
    pub anycast: AnycastConfig,

    /// Forwarding policy computation
    pub policy: PolicyConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Edge attribute paths are ranked by
    pub metric: PathMetric,

    /// Candidate paths kept per switch pair
    pub k_paths: usize,

    /// Topology refresh cadence in seconds
    pub discovery_period_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub bandwidth_period_secs: f64,
    pub delay_period_secs: f64,

    /// Gap between echo requests to consecutive switches
    pub echo_interval_secs: f64,

    /// Counter samples kept per port/flow
    pub history_len: usize,

    /// Force bandwidth polling on or off; follows the metric when unset
    pub enable_bandwidth: Option<bool>,

    /// Force delay probing on or off; follows the metric when unset
    pub enable_delay: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub idle_timeout: u16,
    pub hard_timeout: u16,

    /// Priority of shortest-path forwarding rules
    pub forwarding_priority: u16,

    /// Priority of anycast rewrite rules
    pub anycast_priority: u16,
}

/// Ingress switch carrying client traffic; position is the policy row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressNode {
    pub name: String,
    pub dpid: Dpid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub anycast_ip: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: TransportProtocol,
    #[serde(default)]
    pub description: String,
    /// Instance pool; position is the policy column
    pub instances: Vec<InstanceConfig>,
}

fn default_protocol() -> TransportProtocol {
    TransportProtocol::Tcp
}

impl ServiceConfig {
    pub fn service_id(&self) -> ServiceId {
        ServiceId::new(self.anycast_ip, self.port, self.protocol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnycastConfig {
    /// MAC the controller answers anycast ARP requests with
    pub sentinel_mac: MacAddr,

    pub policy_update_period_secs: f64,

    /// Retry cadence while waiting for topology before creating entries
    pub entry_init_period_secs: f64,

    /// Seed for dispatch-sequence shuffling
    pub dispatch_seed: u64,

    pub ingress: Vec<IngressNode>,
    pub services: Vec<ServiceConfig>,
}

/// Forwarding policy algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolicyAlgorithm {
    /// Uniform split over the instance pool
    #[default]
    #[serde(rename = "balance")]
    Balance,
    /// Split proportional to calibrated instance capacity
    #[serde(rename = "qps_weighted")]
    QpsWeighted,
    /// Entropy-regularized optimal transport
    #[serde(rename = "ot")]
    OptimalTransport,
    /// Greedy least-utilized instance
    #[serde(rename = "cfn")]
    DynamicFeedback,
    /// Lowest-delay link per ingress
    #[serde(rename = "link")]
    ShortestLink,
}

impl FromStr for PolicyAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches("_algo") {
            "balance" => Ok(PolicyAlgorithm::Balance),
            "qps_weighted" => Ok(PolicyAlgorithm::QpsWeighted),
            "ot" => Ok(PolicyAlgorithm::OptimalTransport),
            "cfn" => Ok(PolicyAlgorithm::DynamicFeedback),
            "link" => Ok(PolicyAlgorithm::ShortestLink),
            other => Err(ConfigError::Invalid(format!("unknown policy algorithm: {}", other))),
        }
    }
}

impl fmt::Display for PolicyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyAlgorithm::Balance => "balance",
            PolicyAlgorithm::QpsWeighted => "qps_weighted",
            PolicyAlgorithm::OptimalTransport => "ot",
            PolicyAlgorithm::DynamicFeedback => "cfn",
            PolicyAlgorithm::ShortestLink => "link",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub algorithm: PolicyAlgorithm,

    /// JSON table: instance name -> sustainable requests/s
    pub capacity_table: Option<PathBuf>,

    /// JSON table: ingress name -> arrival requests/s
    pub arrival_table: Option<PathBuf>,

    /// Request payload sizes in bytes
    pub payload_in_bytes: f64,
    pub payload_out_bytes: f64,

    pub sinkhorn_reg: f64,
    pub sinkhorn_tolerance: f64,
    pub sinkhorn_max_iters: usize,

    /// Container name prefix stripped from CPU probe output
    pub container_prefix: String,

    /// Seed for dynamic-feedback noise
    pub noise_seed: u64,

    /// Command printing `name: 12.34%` lines
    pub cpu_probe_command: String,

    pub cpu_probe_period_secs: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: uuid::Uuid::new_v4().to_string(),
            network: NetworkConfig::default(),
            topology: TopologyConfig::default(),
            monitor: MonitorConfig::default(),
            flow: FlowConfig::default(),
            anycast: AnycastConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 6653,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            metric: PathMetric::Hop,
            k_paths: 1,
            discovery_period_secs: 20.0,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bandwidth_period_secs: 20.0,
            delay_period_secs: 10.0,
            echo_interval_secs: 0.5,
            history_len: 5,
            enable_bandwidth: None,
            enable_delay: None,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 600,
            hard_timeout: 3600,
            forwarding_priority: 1,
            anycast_priority: 0x9000,
        }
    }
}

impl Default for AnycastConfig {
    fn default() -> Self {
        // Four prime-app instances behind one anycast address, six client-side ingress switches
        let instances = (1..=4u8)
            .map(|j| InstanceConfig {
                name: format!("primeApp{}", j),
                ip: Ipv4Addr::new(10, 0, 0, 6 + j),
                port: 8000,
            })
            .collect();
        let ingress = (1..=6u64)
            .map(|i| IngressNode {
                name: format!("cpNode{}", i),
                dpid: 4 + i,
            })
            .collect();

        Self {
            sentinel_mac: MacAddr([0xf0, 0, 0, 0, 0, 0x01]),
            policy_update_period_secs: 4.0,
            entry_init_period_secs: 20.0,
            dispatch_seed: 68,
            ingress,
            services: vec![ServiceConfig {
                anycast_ip: Ipv4Addr::new(192, 168, 255, 1),
                port: 8000,
                protocol: TransportProtocol::Tcp,
                description: "prime-app".to_string(),
                instances,
            }],
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            algorithm: PolicyAlgorithm::Balance,
            capacity_table: Some(PathBuf::from("prime_app_rps.json")),
            arrival_table: Some(PathBuf::from("cpn_node_rps.json")),
            payload_in_bytes: 10.0,
            payload_out_bytes: 33.0,
            sinkhorn_reg: 1e-2,
            sinkhorn_tolerance: 1e-8,
            sinkhorn_max_iters: 100,
            container_prefix: "mn.".to_string(),
            noise_seed: 68,
            cpu_probe_command: "docker stats --no-stream --format \"{{.Name}}: {{.CPUPerc}}\"".to_string(),
            cpu_probe_period_secs: 4.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = ControllerConfig::default();
        config.apply_env();
        config
    }

    /// Load a JSON configuration file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ControllerConfig = serde_json::from_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        // Controller ID
        if let Ok(id) = std::env::var("CPN_CONTROLLER_ID") {
            self.controller_id = id;
        }

        // Bridge listener
        if let Ok(addr) = std::env::var("CPN_LISTEN_ADDR") {
            self.network.listen_addr = addr;
        }
        if let Ok(port) = std::env::var("CPN_PORT") {
            if let Ok(port) = port.parse() {
                self.network.port = port;
            }
        }

        // Path metric and candidate count
        if let Ok(weight) = std::env::var("CPN_WEIGHT") {
            if let Ok(metric) = weight.parse() {
                self.topology.metric = metric;
            }
        }
        if let Ok(k) = std::env::var("CPN_K_PATHS") {
            if let Ok(k) = k.parse() {
                self.topology.k_paths = k;
            }
        }

        // Policy algorithm
        if let Ok(policy) = std::env::var("CPN_POLICY") {
            if let Ok(algorithm) = policy.parse() {
                self.policy.algorithm = algorithm;
            }
        }
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.k_paths == 0 {
            return Err(ConfigError::Invalid("k_paths must be at least 1".into()));
        }
        if self.monitor.history_len < 2 {
            return Err(ConfigError::Invalid("history_len must be at least 2".into()));
        }

        let periods = [
            ("discovery_period_secs", self.topology.discovery_period_secs),
            ("bandwidth_period_secs", self.monitor.bandwidth_period_secs),
            ("delay_period_secs", self.monitor.delay_period_secs),
            ("policy_update_period_secs", self.anycast.policy_update_period_secs),
            ("entry_init_period_secs", self.anycast.entry_init_period_secs),
            ("cpu_probe_period_secs", self.policy.cpu_probe_period_secs),
        ];
        for (name, value) in periods {
            if !(value > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.monitor.echo_interval_secs < 0.0 {
            return Err(ConfigError::Invalid("echo_interval_secs must not be negative".into()));
        }
        if !(self.policy.sinkhorn_reg > 0.0) {
            return Err(ConfigError::Invalid("sinkhorn_reg must be positive".into()));
        }

        let mut ingress_names = HashSet::new();
        let mut ingress_dpids = HashSet::new();
        for node in &self.anycast.ingress {
            if !ingress_names.insert(node.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate ingress name {}", node.name)));
            }
            if !ingress_dpids.insert(node.dpid) {
                return Err(ConfigError::Invalid(format!("duplicate ingress dpid {}", node.dpid)));
            }
        }

        let mut service_ids = HashSet::new();
        for service in &self.anycast.services {
            let id = service.service_id();
            if !service_ids.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate service {}", id)));
            }
            if service.instances.is_empty() {
                return Err(ConfigError::Invalid(format!("service {} has no instances", id)));
            }
            let mut names = HashSet::new();
            for instance in &service.instances {
                if !names.insert(instance.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate instance name {} in service {}",
                        instance.name, id
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn bandwidth_enabled(&self) -> bool {
        self.monitor
            .enable_bandwidth
            .unwrap_or(self.topology.metric == PathMetric::Bandwidth)
    }

    pub fn delay_enabled(&self) -> bool {
        self.monitor
            .enable_delay
            .unwrap_or(self.topology.metric == PathMetric::Delay)
    }

    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.network.listen_addr, self.network.port)
    }
}

impl TopologyConfig {
    pub fn discovery_period(&self) -> Duration {
        secs(self.discovery_period_secs)
    }
}

impl MonitorConfig {
    pub fn bandwidth_period(&self) -> Duration {
        secs(self.bandwidth_period_secs)
    }

    pub fn delay_period(&self) -> Duration {
        secs(self.delay_period_secs)
    }

    pub fn echo_interval(&self) -> Duration {
        secs(self.echo_interval_secs)
    }
}

impl AnycastConfig {
    pub fn policy_update_period(&self) -> Duration {
        secs(self.policy_update_period_secs)
    }

    pub fn entry_init_period(&self) -> Duration {
        secs(self.entry_init_period_secs)
    }

    /// Policy row of an ingress switch
    pub fn ingress_index(&self, dpid: Dpid) -> Option<usize> {
        self.ingress.iter().position(|node| node.dpid == dpid)
    }
}

impl PolicyConfig {
    pub fn cpu_probe_period(&self) -> Duration {
        secs(self.cpu_probe_period_secs)
    }
}
