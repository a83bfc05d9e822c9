//! Inbound fabric events
//!
//! One tagged enum for everything a switch (or the link-discovery
//! machinery of the adapter) reports to the controller.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::net::{Dpid, PortNo};
use crate::openflow::{FlowMatch, FlowStats, PortDesc, PortStats, NO_BUFFER};

/// Directed inter-switch link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub src: Dpid,
    pub src_port: PortNo,
    pub dst: Dpid,
    pub dst_port: PortNo,
}

impl Link {
    pub fn new(src: Dpid, src_port: PortNo, dst: Dpid, dst_port: PortNo) -> Self {
        Self { src, src_port, dst, dst_port }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }
}

/// Frame punted to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketIn {
    pub dpid: Dpid,
    pub in_port: PortNo,
    #[serde(default = "no_buffer")]
    pub buffer_id: u32,
    pub data: Bytes,
}

fn no_buffer() -> u32 {
    NO_BUFFER
}

impl PacketIn {
    pub fn new(dpid: Dpid, in_port: PortNo, data: Bytes) -> Self {
        Self {
            dpid,
            in_port,
            buffer_id: NO_BUFFER,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
}

/// A rule expired or was deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRemoved {
    pub dpid: Dpid,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_sec: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

/// Everything the fabric reports to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FabricEvent {
    SwitchEnter {
        dpid: Dpid,
        ports: Vec<PortNo>,
    },
    SwitchLeave {
        dpid: Dpid,
    },
    PortStatus {
        dpid: Dpid,
        port_no: PortNo,
        reason: PortReason,
    },
    LinkAdd(Link),
    LinkDelete(Link),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatsReply {
        dpid: Dpid,
        stats: Vec<PortStats>,
    },
    FlowStatsReply {
        dpid: Dpid,
        stats: Vec<FlowStats>,
    },
    PortDescReply {
        dpid: Dpid,
        ports: Vec<PortDesc>,
    },
    EchoReply {
        dpid: Dpid,
        payload: Bytes,
    },
    /// Link-discovery loopback probe: controller -> src -> dst -> controller
    LinkProbe {
        #[serde(flatten)]
        link: Link,
        /// Probe round trip
        #[serde(with = "duration_secs")]
        round_trip: Duration,
    },
}

impl FabricEvent {
    /// Switch this event is about, if any
    pub fn dpid(&self) -> Option<Dpid> {
        match self {
            FabricEvent::SwitchEnter { dpid, .. }
            | FabricEvent::SwitchLeave { dpid }
            | FabricEvent::PortStatus { dpid, .. }
            | FabricEvent::PortStatsReply { dpid, .. }
            | FabricEvent::FlowStatsReply { dpid, .. }
            | FabricEvent::PortDescReply { dpid, .. }
            | FabricEvent::EchoReply { dpid, .. } => Some(*dpid),
            FabricEvent::PacketIn(pi) => Some(pi.dpid),
            FabricEvent::FlowRemoved(fr) => Some(fr.dpid),
            FabricEvent::LinkAdd(link) | FabricEvent::LinkDelete(link) => Some(link.src),
            FabricEvent::LinkProbe { link, .. } => Some(link.src),
        }
    }

    /// Whether this event changes the switch/link structure
    pub fn is_topology_change(&self) -> bool {
        matches!(
            self,
            FabricEvent::SwitchEnter { .. }
                | FabricEvent::SwitchLeave { .. }
                | FabricEvent::PortStatus { .. }
                | FabricEvent::LinkAdd(_)
                | FabricEvent::LinkDelete(_)
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
