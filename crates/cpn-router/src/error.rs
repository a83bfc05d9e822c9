//! Error types for the anycast engine

use cpn_router_core::PolicyError;
use cpn_types::{CpnError, Dpid, ServiceId};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Anycast routing error types
#[derive(Debug, Error)]
pub enum AnycastError {
    /// The anycast address is known but not with this port/protocol
    #[error("Unknown service: {0}")]
    UnknownService(ServiceId),

    /// No forwarding entry exists for this switch and service
    #[error("No forwarding entry for {service} on switch {dpid}")]
    NoEntry { dpid: Dpid, service: ServiceId },

    /// The switch is not a configured ingress node
    #[error("Switch {0} is not an ingress node")]
    UnknownIngress(Dpid),

    /// The dispatch sequence produced no instance
    #[error("Empty dispatch sequence for {0}")]
    EmptyDispatch(ServiceId),

    /// The chosen instance has not been seen on any access port yet
    #[error("No MAC address learned for instance {0}")]
    InstanceUnresolved(Ipv4Addr),

    /// No path from the ingress switch toward the instance
    #[error("No output port from switch {dpid} toward {ip}")]
    NoOutputPort { dpid: Dpid, ip: Ipv4Addr },

    /// Policy engine failure
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Southbound send failed
    #[error("Southbound error: {0}")]
    Southbound(#[from] CpnError),
}

pub type AnycastResult<T> = Result<T, AnycastError>;
