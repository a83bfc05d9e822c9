//! CPN Core - configuration and service catalogue
//!
//! Shared by the network, policy and anycast crates and by the
//! controller binary.

pub mod config;
pub mod service;

pub use config::{
    AnycastConfig, ConfigError, ControllerConfig, FlowConfig, IngressNode, InstanceConfig,
    MonitorConfig, NetworkConfig, PolicyAlgorithm, PolicyConfig, ServiceConfig, TopologyConfig,
};
pub use service::{ServiceCatalogue, ServiceDescriptor, NamedInstance};
