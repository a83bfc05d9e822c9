//! Shortest-path forwarding
//!
//! Handles first packets of plain IPv4 flows and ARP traffic that the
//! anycast engine does not claim. Rules are planned for every hop first
//! and only written once every port pair on the path is known.

use bytes::Bytes;
use cpn_core::{FlowConfig, ServiceCatalogue};
use cpn_types::{
    ArpPacket, Dpid, EthernetFrame, FlowAction, FlowMatch, FlowMod, NetworkLayer, PacketIn,
    PacketOut, PathMetric, PortNo, Southbound,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::awareness::TopologyStore;
use crate::graph::widest_path;
use crate::monitor::BandwidthMonitor;
use crate::{NetworkError, NetworkResult};

/// (eth_type, src, dst) of a unidirectional flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDescriptor {
    pub eth_type: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl FlowDescriptor {
    pub fn new(eth_type: u16, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { eth_type, src, dst }
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.eth_type, self.dst, self.src)
    }

    fn flow_match(&self, in_port: PortNo) -> FlowMatch {
        FlowMatch {
            in_port: Some(in_port),
            eth_type: Some(self.eth_type),
            ipv4_src: Some(self.src),
            ipv4_dst: Some(self.dst),
            ..FlowMatch::default()
        }
    }
}

/// A rule pair for one switch: forward in -> out, reverse out -> in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HopRule {
    dpid: Dpid,
    in_port: PortNo,
    out_port: PortNo,
}

/// Shortest-path forwarding engine
pub struct ShortestForwarding {
    topology: Arc<TopologyStore>,
    monitor: Option<Arc<BandwidthMonitor>>,
    southbound: Arc<dyn Southbound>,
    catalogue: ServiceCatalogue,
    metric: PathMetric,
    flow: FlowConfig,
}

impl ShortestForwarding {
    pub fn new(
        topology: Arc<TopologyStore>,
        monitor: Option<Arc<BandwidthMonitor>>,
        southbound: Arc<dyn Southbound>,
        catalogue: ServiceCatalogue,
        flow: FlowConfig,
    ) -> Self {
        let metric = topology.metric();
        Self {
            topology,
            monitor,
            southbound,
            catalogue,
            metric,
            flow,
        }
    }

    pub fn metric(&self) -> PathMetric {
        self.metric
    }

    /// Handle a packet-in for ARP or IPv4; other frames are ignored
    pub fn handle_packet_in(&self, packet: &PacketIn) {
        let frame = match EthernetFrame::parse(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(dpid = packet.dpid, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match &frame.network {
            NetworkLayer::Arp(arp) => self.arp_forwarding(packet, arp),
            NetworkLayer::Ipv4(ip) => {
                let flow = FlowDescriptor::new(frame.ethertype(), ip.src, ip.dst);
                if let Err(e) = self.shortest_forwarding(packet, flow) {
                    match e {
                        NetworkError::MissingPortPair { .. } | NetworkError::HostPortNotFound(_) => {
                            warn!(dpid = packet.dpid, src = %flow.src, dst = %flow.dst, error = %e, "Path install abandoned")
                        }
                        _ => info!(dpid = packet.dpid, src = %flow.src, dst = %flow.dst, error = %e, "No forwarding decision"),
                    }
                }
            }
            NetworkLayer::Other { ethertype, .. } => {
                debug!(dpid = packet.dpid, ethertype = ethertype, "Ignoring non-IP frame");
            }
        }
    }

    // ========== ARP ==========

    /// Send ARP straight to a known host, or flood it to every unlearned access port
    pub fn arp_forwarding(&self, packet: &PacketIn, arp: &ArpPacket) {
        if self.catalogue.is_anycast_ip(arp.target_ip) {
            return;
        }
        match self.topology.resolve_host(arp.target_ip) {
            Some((dpid, port)) => {
                debug!(target = %arp.target_ip, dpid = dpid, port = port, "Delivering ARP to known host");
                self.send_packet_out(dpid, PacketOut::inject(port, packet.data.clone()));
            }
            None => {
                self.flood(&packet.data);
            }
        }
    }

    /// Packet-out on every access port with no learned host
    pub fn flood(&self, data: &Bytes) -> usize {
        let ports: Vec<(Dpid, PortNo)> = self
            .topology
            .access_ports()
            .into_iter()
            .filter(|&(dpid, port)| self.topology.host_at(dpid, port).is_none())
            .collect();
        for &(dpid, port) in &ports {
            self.send_packet_out(dpid, PacketOut::inject(port, data.clone()));
        }
        debug!(ports = ports.len(), "ARP flooded");
        ports.len()
    }

    // ========== Path selection ==========

    /// Source and destination switch of a flow.
    ///
    /// A packet entering on an access port must come from where its source
    /// host was learned; otherwise there is no source switch.
    pub fn resolve_switches(
        &self,
        dpid: Dpid,
        in_port: PortNo,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Option<(Dpid, Option<Dpid>)> {
        if self.topology.is_access_port(dpid, in_port)
            && self.topology.resolve_host(src) != Some((dpid, in_port))
        {
            return None;
        }
        let dst_sw = self.topology.resolve_host(dst).map(|(sw, _)| sw);
        Some((dpid, dst_sw))
    }

    /// Path between two switches under the configured metric
    pub fn path(&self, src: Dpid, dst: Dpid) -> Option<Vec<Dpid>> {
        match self.metric {
            PathMetric::Hop => self.topology.paths().first(src, dst).cloned(),
            PathMetric::Delay => match self.topology.paths().first(src, dst) {
                Some(path) => Some(path.clone()),
                None => self
                    .topology
                    .compute_and_cache(src, dst, PathMetric::Delay, 1)
                    .into_iter()
                    .next(),
            },
            PathMetric::Bandwidth => self
                .monitor
                .as_ref()
                .and_then(|m| m.best_path(src, dst))
                .or_else(|| self.widest_on_demand(src, dst)),
        }
    }

    fn widest_on_demand(&self, src: Dpid, dst: Dpid) -> Option<Vec<Dpid>> {
        let candidates = self
            .topology
            .compute_and_cache(src, dst, PathMetric::Hop, self.topology.k_paths());
        if let Some(monitor) = &self.monitor {
            monitor.invalidate_best_paths();
        }
        let graph = self.topology.graph();
        widest_path(&graph, &candidates).map(|(_, path)| path.clone())
    }

    /// First-hop output port from `dpid` toward the host owning `dst_ip`
    pub fn get_output_port(&self, dpid: Dpid, dst_ip: Ipv4Addr) -> Option<PortNo> {
        let (dst_sw, host_port) = self.topology.resolve_host(dst_ip)?;
        if dst_sw == dpid {
            return Some(host_port);
        }
        let path = self.path(dpid, dst_sw)?;
        match path.as_slice() {
            [_] => Some(host_port),
            [first, next, ..] => self.topology.link_ports(*first, *next).map(|(out, _)| out),
            [] => None,
        }
    }

    // ========== Rule installation ==========

    fn shortest_forwarding(&self, packet: &PacketIn, flow: FlowDescriptor) -> NetworkResult<()> {
        let (src_sw, dst_sw) = self
            .resolve_switches(packet.dpid, packet.in_port, flow.src, flow.dst)
            .ok_or(NetworkError::UnknownSwitch(packet.dpid))?;
        let dst_sw = dst_sw.ok_or(NetworkError::HostPortNotFound(flow.dst))?;
        let path = self
            .path(src_sw, dst_sw)
            .ok_or(NetworkError::NoPath { src: src_sw, dst: dst_sw })?;
        info!(src = %flow.src, dst = %flow.dst, path = ?path, "Installing path");
        self.install_path(&path, flow, packet.in_port, packet.buffer_id, Some(packet.data.clone()))
    }

    /// Per-hop (in, out) ports along `path`, or an error if any is unknown
    fn plan_path(&self, path: &[Dpid], flow: FlowDescriptor, in_port: PortNo) -> NetworkResult<Vec<HopRule>> {
        let (&first, &last) = match (path.first(), path.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(NetworkError::EmptyPath),
        };
        let host_port = |dpid: Dpid| match self.topology.resolve_host(flow.dst) {
            Some((sw, port)) if sw == dpid => Ok(port),
            _ => Err(NetworkError::HostPortNotFound(flow.dst)),
        };
        let pair = |src: Dpid, dst: Dpid| {
            self.topology
                .link_ports(src, dst)
                .ok_or(NetworkError::MissingPortPair { src, dst })
        };

        if path.len() == 1 {
            return Ok(vec![HopRule {
                dpid: first,
                in_port,
                out_port: host_port(first)?,
            }]);
        }

        let mut rules = Vec::with_capacity(path.len());
        for window in path.windows(3) {
            let (_, in_port) = pair(window[0], window[1])?;
            let (out_port, _) = pair(window[1], window[2])?;
            rules.push(HopRule {
                dpid: window[1],
                in_port,
                out_port,
            });
        }

        let (_, last_in) = pair(path[path.len() - 2], last)?;
        rules.push(HopRule {
            dpid: last,
            in_port: last_in,
            out_port: host_port(last)?,
        });

        let (first_out, _) = pair(first, path[1])?;
        rules.push(HopRule {
            dpid: first,
            in_port,
            out_port: first_out,
        });
        Ok(rules)
    }

    /// Install forward and reverse rules on every hop, then release the
    /// first packet out of the ingress switch.
    ///
    /// Nothing is written unless every hop's ports are known.
    pub fn install_path(
        &self,
        path: &[Dpid],
        flow: FlowDescriptor,
        in_port: PortNo,
        buffer_id: u32,
        data: Option<Bytes>,
    ) -> NetworkResult<()> {
        let rules = self.plan_path(path, flow, in_port)?;
        let back = flow.reversed();

        for rule in &rules {
            self.send_flow_mod(rule.dpid, flow, rule.in_port, rule.out_port)?;
            self.send_flow_mod(rule.dpid, back, rule.out_port, rule.in_port)?;
        }

        // The ingress rule is always planned last
        if let Some(ingress) = rules.last() {
            if let Some(packet_out) =
                PacketOut::new(buffer_id, in_port, vec![FlowAction::output(ingress.out_port)], data)
            {
                self.southbound.packet_out(ingress.dpid, packet_out)?;
            }
        }
        Ok(())
    }

    fn send_flow_mod(&self, dpid: Dpid, flow: FlowDescriptor, in_port: PortNo, out_port: PortNo) -> NetworkResult<()> {
        let flow_mod = FlowMod::new(
            self.flow.forwarding_priority,
            flow.flow_match(in_port),
            vec![FlowAction::output(out_port)],
        )
        .with_timeouts(self.flow.idle_timeout, self.flow.hard_timeout);
        self.southbound.flow_mod(dpid, flow_mod)?;
        Ok(())
    }

    fn send_packet_out(&self, dpid: Dpid, packet_out: PacketOut) {
        if let Err(e) = self.southbound.packet_out(dpid, packet_out) {
            warn!(dpid = dpid, error = %e, "Packet-out failed");
        }
    }
}
