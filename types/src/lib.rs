//! Shared types for the CPN controller
//!
//! Everything that crosses a crate boundary lives here: switch and host
//! identifiers, the anycast service identifiers, the southbound message
//! model, inbound fabric events and the frame codec used for packet-in
//! parsing and packet-out synthesis.

// ========== Core Modules ==========
pub mod net;
pub mod openflow;
pub mod event;
pub mod packet;
pub mod southbound;

// Export commonly used types
pub use net::{
    Dpid, PortNo, MacAddr, TransportProtocol, ServiceId, ServiceInstance, PathMetric,
    ETH_TYPE_IP, ETH_TYPE_ARP, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
pub use openflow::{
    FlowMatch, FlowAction, FlowMod, PacketOut, SouthboundMessage,
    PortStats, FlowStats, PortDesc,
    NO_BUFFER, PORT_CONTROLLER, PORT_LOCAL, PORT_ANY,
};
pub use event::{FabricEvent, Link, PacketIn, FlowRemoved, FlowRemovedReason, PortReason};
pub use packet::{
    EthernetFrame, NetworkLayer, ArpPacket, Ipv4Packet, TransportLayer, IcmpPacket,
    ARP_REQUEST, ARP_REPLY, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY,
};
pub use southbound::{Southbound, RecordingSouthbound, ChannelSouthbound, OutboundMessage};

// Error types
pub type CpnResult<T> = Result<T, CpnError>;

#[derive(Debug, thiserror::Error)]
pub enum CpnError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown datapath: {0:#x}")]
    UnknownDatapath(Dpid),

    #[error("Southbound channel closed")]
    ChannelClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
