//! Error types for the network module

use cpn_types::{CpnError, Dpid};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Network error types
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Path computation found nothing between the two switches
    #[error("No path from {src} to {dst}")]
    NoPath { src: Dpid, dst: Dpid },

    /// A path was empty
    #[error("Empty path")]
    EmptyPath,

    /// Consecutive path hops are not joined by a known link
    #[error("Link {src} -> {dst} is not in the link table")]
    MissingPortPair { src: Dpid, dst: Dpid },

    /// The host's access port is unknown
    #[error("No access port recorded for host {0}")]
    HostPortNotFound(Ipv4Addr),

    /// Switch not known to the topology store
    #[error("Unknown switch: {0}")]
    UnknownSwitch(Dpid),

    /// Southbound send failed
    #[error("Southbound error: {0}")]
    Southbound(#[from] CpnError),
}
