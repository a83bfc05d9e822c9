//! Southbound message model
//!
//! A protocol-neutral rendition of the OpenFlow 1.3 subset the controller
//! speaks: flow-mods, packet-outs, statistics requests and echo probes.
//! The fabric bridge serializes these as JSON; the switches' own wire
//! format is the adapter's concern.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::net::{MacAddr, PortNo, ETH_TYPE_ARP, ETH_TYPE_IP};

/// Buffer id meaning "frame carried inline"
pub const NO_BUFFER: u32 = 0xffff_ffff;
/// Reserved port: send to controller
pub const PORT_CONTROLLER: PortNo = 0xffff_fffd;
/// Reserved port: local switch stack
pub const PORT_LOCAL: PortNo = 0xffff_fffe;
/// Wildcard port
pub const PORT_ANY: PortNo = 0xffff_ffff;

/// Match fields of a flow rule
///
/// Absent fields are wildcards. Two matches are "the same rule" when they
/// are structurally equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_type: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_src: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_dst: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_dst: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_dst: Option<u16>,
}

impl FlowMatch {
    /// Match everything (table-miss)
    pub fn any() -> Self {
        Self::default()
    }

    /// IPv4 match on source/destination address
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self {
            eth_type: Some(ETH_TYPE_IP),
            ipv4_src: Some(src),
            ipv4_dst: Some(dst),
            ..Default::default()
        }
    }

    pub fn arp() -> Self {
        Self {
            eth_type: Some(ETH_TYPE_ARP),
            ..Default::default()
        }
    }

    pub fn with_in_port(mut self, port: PortNo) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn with_ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    pub fn with_tcp_src(mut self, port: u16) -> Self {
        self.tcp_src = Some(port);
        self
    }

    pub fn with_tcp_dst(mut self, port: u16) -> Self {
        self.tcp_dst = Some(port);
        self
    }

    pub fn with_udp_src(mut self, port: u16) -> Self {
        self.udp_src = Some(port);
        self
    }

    pub fn with_udp_dst(mut self, port: u16) -> Self {
        self.udp_dst = Some(port);
        self
    }
}

/// Apply-actions entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    Output { port: PortNo },
    SetEthSrc { mac: MacAddr },
    SetEthDst { mac: MacAddr },
    SetIpv4Src { ip: Ipv4Addr },
    SetIpv4Dst { ip: Ipv4Addr },
    SetTcpSrc { port: u16 },
    SetTcpDst { port: u16 },
    SetUdpSrc { port: u16 },
    SetUdpDst { port: u16 },
}

impl FlowAction {
    pub fn output(port: PortNo) -> Self {
        FlowAction::Output { port }
    }

    /// Output port of this action, if it is an output action
    pub fn output_port(&self) -> Option<PortNo> {
        match self {
            FlowAction::Output { port } => Some(*port),
            _ => None,
        }
    }
}

/// Flow rule installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub buffer_id: u32,
    /// Ask the switch for a flow-removed notification on expiry
    pub send_flow_removed: bool,
}

impl FlowMod {
    pub fn new(priority: u16, flow_match: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
            flow_match,
            actions,
            buffer_id: NO_BUFFER,
            send_flow_removed: false,
        }
    }

    pub fn with_timeouts(mut self, idle_timeout: u16, hard_timeout: u16) -> Self {
        self.idle_timeout = idle_timeout;
        self.hard_timeout = hard_timeout;
        self
    }

    pub fn with_flow_removed(mut self) -> Self {
        self.send_flow_removed = true;
        self
    }

    /// First output port among the actions
    pub fn output_port(&self) -> Option<PortNo> {
        self.actions.iter().find_map(FlowAction::output_port)
    }
}

/// Frame injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: PortNo,
    pub actions: Vec<FlowAction>,
    /// Inline frame; only meaningful with `NO_BUFFER`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

impl PacketOut {
    /// Packet-out for a frame the switch buffered or the controller carries.
    ///
    /// With `NO_BUFFER` the data must be present; returns `None` otherwise.
    pub fn new(buffer_id: u32, in_port: PortNo, actions: Vec<FlowAction>, data: Option<Bytes>) -> Option<Self> {
        let data = if buffer_id == NO_BUFFER {
            Some(data?)
        } else {
            None
        };
        Some(Self {
            buffer_id,
            in_port,
            actions,
            data,
        })
    }

    /// Controller-originated frame sent out of a single port
    pub fn inject(out_port: PortNo, data: Bytes) -> Self {
        Self {
            buffer_id: NO_BUFFER,
            in_port: PORT_CONTROLLER,
            actions: vec![FlowAction::output(out_port)],
            data: Some(data),
        }
    }
}

/// Everything the controller sends to a switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SouthboundMessage {
    FlowMod(FlowMod),
    PacketOut(PacketOut),
    PortStatsRequest,
    FlowStatsRequest,
    PortDescRequest,
    EchoRequest { payload: Bytes },
}

impl SouthboundMessage {
    pub fn as_flow_mod(&self) -> Option<&FlowMod> {
        match self {
            SouthboundMessage::FlowMod(fm) => Some(fm),
            _ => None,
        }
    }

    pub fn as_packet_out(&self) -> Option<&PacketOut> {
        match self {
            SouthboundMessage::PacketOut(po) => Some(po),
            _ => None,
        }
    }
}

/// Per-port counters from a port-stats reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    pub port_no: PortNo,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
}

/// Per-flow counters from a flow-stats reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub priority: u16,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub packet_count: u64,
    pub byte_count: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
}

/// Port description entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDesc {
    pub port_no: PortNo,
    pub config: u32,
    pub state: u32,
    /// Current rated speed in kbit/s
    pub curr_speed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_builder_equality() {
        let a = FlowMatch::ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .with_in_port(3)
            .with_ip_proto(6)
            .with_tcp_dst(8000);
        let b = FlowMatch::ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .with_in_port(3)
            .with_ip_proto(6)
            .with_tcp_dst(8000);
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_in_port(4));
    }

    #[test]
    fn test_packet_out_requires_data_without_buffer() {
        assert!(PacketOut::new(NO_BUFFER, 1, vec![FlowAction::output(2)], None).is_none());

        let buffered = PacketOut::new(7, 1, vec![FlowAction::output(2)], Some(Bytes::from_static(b"x"))).unwrap();
        assert_eq!(buffered.buffer_id, 7);
        assert!(buffered.data.is_none());
    }

    #[test]
    fn test_flow_mod_output_port() {
        let fm = FlowMod::new(
            1,
            FlowMatch::any(),
            vec![
                FlowAction::SetIpv4Dst { ip: Ipv4Addr::new(10, 0, 0, 5) },
                FlowAction::output(4),
            ],
        )
        .with_timeouts(600, 3600);
        assert_eq!(fm.output_port(), Some(4));
        assert_eq!(fm.idle_timeout, 600);
    }

    #[test]
    fn test_message_json_shape() {
        let msg = SouthboundMessage::FlowMod(FlowMod::new(0, FlowMatch::any(), vec![FlowAction::output(PORT_CONTROLLER)]));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "flow_mod");
        assert_eq!(json["actions"][0]["type"], "output");
        let back: SouthboundMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
