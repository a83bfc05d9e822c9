//! CPN Network - topology awareness and path programming
//!
//! ```text
//! fabric events ──► TopologyStore ◄── BandwidthMonitor (free bandwidth)
//!                        │        ◄── DelayDetector    (link delay)
//!                        ▼
//!                ShortestForwarding ──► flow-mods / packet-outs
//! ```
//!
//! The topology store is the only writer of the graph and the access
//! table; the providers annotate edges through its accessors.

pub mod awareness;
pub mod delay;
pub mod error;
pub mod forwarding;
pub mod graph;
pub mod monitor;

pub use awareness::{HostRecord, PathCache, TopologyStore};
pub use delay::DelayDetector;
pub use error::NetworkError;
pub use forwarding::{FlowDescriptor, ShortestForwarding};
pub use graph::{EdgeAttrs, TopologyGraph, MAX_CAPACITY, SWITCH_INTERIOR_BANDWIDTH, SWITCH_INTERIOR_DELAY};
pub use monitor::{BandwidthMonitor, FlowKey, PortFeature, WidestPaths};

pub type NetworkResult<T> = Result<T, NetworkError>;
