//! Anycast service-routing engine
//!
//! Claims every packet addressed to an anycast IP. ARP requests and ICMP
//! echo requests are answered locally; the first packet of a TCP/UDP flow
//! picks the next instance from the entry's dispatch sequence and installs
//! a forward/reverse rewrite rule pair on the ingress switch.
//!
//! Entries are keyed by (ingress dpid, service). The row of the policy
//! matrix an entry follows is the position of its switch in the configured
//! ingress list.

use cpn_core::{ControllerConfig, FlowConfig, IngressNode, ServiceCatalogue};
use cpn_network::{ShortestForwarding, TopologyStore};
use cpn_router_core::{build_strategy, PolicyEngine, SignalSource, UtilizationFeed};
use cpn_types::{
    ArpPacket, Dpid, EthernetFrame, FlowAction, FlowMatch, FlowRemoved, MacAddr, NetworkLayer,
    PacketIn, PacketOut, PortNo, ServiceId, ServiceInstance, Southbound, TransportLayer,
    TransportProtocol,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::entry::{CpnForwardingEntry, EntryState, InstalledRules};
use crate::error::{AnycastError, AnycastResult};
use crate::rules::{forward_match, RewriteRules, RewriteTarget};
use crate::view::TopologyView;

/// (ingress switch, service)
pub type EntryKey = (Dpid, ServiceId);

pub struct CpnRouter {
    topology: Arc<TopologyStore>,
    forwarding: Arc<ShortestForwarding>,
    southbound: Arc<dyn Southbound>,
    catalogue: ServiceCatalogue,
    /// Position is the policy row
    ingress: Vec<IngressNode>,
    policies: BTreeMap<ServiceId, PolicyEngine>,
    entries: Mutex<BTreeMap<EntryKey, CpnForwardingEntry>>,
    rng: Mutex<ChaCha8Rng>,
    dispatch_counts: Mutex<BTreeMap<ServiceInstance, u64>>,
    sentinel_mac: MacAddr,
    flow: FlowConfig,
}

impl CpnRouter {
    /// Build one policy engine per catalogued service
    pub fn new(
        config: &ControllerConfig,
        topology: Arc<TopologyStore>,
        forwarding: Arc<ShortestForwarding>,
        southbound: Arc<dyn Southbound>,
        catalogue: ServiceCatalogue,
        signals: Arc<dyn SignalSource>,
        utilization: Arc<UtilizationFeed>,
    ) -> AnycastResult<Self> {
        let ingress = config.anycast.ingress.clone();
        let ingress_names: Vec<String> = ingress.iter().map(|n| n.name.clone()).collect();
        let ingress_dpids: Vec<Dpid> = ingress.iter().map(|n| n.dpid).collect();

        let mut policies = BTreeMap::new();
        for service in catalogue.services() {
            let Some(descriptor) = catalogue.get(&service) else {
                continue;
            };
            let view = TopologyView::new(
                topology.clone(),
                ingress_dpids.clone(),
                descriptor.instances().iter().map(|i| i.ip).collect(),
            );
            let engine = PolicyEngine::new(
                build_strategy(&config.policy),
                ingress_names.clone(),
                descriptor.instance_names(),
                signals.clone(),
                Arc::new(view),
                utilization.clone(),
                config.anycast.policy_update_period(),
            )?;
            policies.insert(service, engine);
        }

        info!(
            services = policies.len(),
            ingress = ingress.len(),
            algorithm = %config.policy.algorithm,
            "Anycast router created"
        );

        Ok(Self {
            topology,
            forwarding,
            southbound,
            catalogue,
            ingress,
            policies,
            entries: Mutex::new(BTreeMap::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.anycast.dispatch_seed)),
            dispatch_counts: Mutex::new(BTreeMap::new()),
            sentinel_mac: config.anycast.sentinel_mac,
            flow: config.flow.clone(),
        })
    }

    // ========== Entries ==========

    /// Create the missing entries once the topology has switches.
    ///
    /// Returns how many were created.
    pub fn initialize_entries(&self) -> usize {
        if self.topology.switch_count() == 0 {
            debug!("Topology empty, deferring entry initialization");
            return 0;
        }

        let mut entries = self.entries.lock();
        let mut rng = self.rng.lock();
        let mut created = 0;
        for (index, node) in self.ingress.iter().enumerate() {
            for (service, policy) in &self.policies {
                let key = (node.dpid, *service);
                if entries.contains_key(&key) {
                    continue;
                }
                let Some(instances) = self.catalogue.instances(service) else {
                    continue;
                };
                let matrix = policy.current();
                let Some(row) = matrix.row(index) else {
                    continue;
                };
                let entry = CpnForwardingEntry::new(node.dpid, *service, instances, row, &mut *rng);
                debug!(
                    dpid = node.dpid,
                    ingress = %node.name,
                    service = %service,
                    cycle = ?entry.dispatch().cycle(),
                    "Forwarding entry created"
                );
                entries.insert(key, entry);
                created += 1;
            }
        }
        if created > 0 {
            info!(created = created, total = entries.len(), "Forwarding entries initialized");
        }
        created
    }

    pub fn entries_initialized(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of one entry
    pub fn entry(&self, dpid: Dpid, service: &ServiceId) -> Option<CpnForwardingEntry> {
        self.entries.lock().get(&(dpid, *service)).cloned()
    }

    pub fn policy(&self, service: &ServiceId) -> Option<&PolicyEngine> {
        self.policies.get(service)
    }

    pub fn services(&self) -> Vec<ServiceId> {
        self.policies.keys().copied().collect()
    }

    /// Times each instance was picked, by packet-in or policy tick
    pub fn dispatch_counts(&self) -> BTreeMap<ServiceInstance, u64> {
        self.dispatch_counts.lock().clone()
    }

    fn ingress_index(&self, dpid: Dpid) -> Option<usize> {
        self.ingress.iter().position(|n| n.dpid == dpid)
    }

    fn count_dispatch(&self, instance: ServiceInstance) {
        *self.dispatch_counts.lock().entry(instance).or_insert(0) += 1;
    }

    // ========== Packet-in ==========

    /// Handle a packet-in; returns true if it was anycast traffic
    pub fn handle_packet_in(&self, packet: &PacketIn) -> bool {
        let frame = match EthernetFrame::parse(&packet.data) {
            Ok(frame) => frame,
            Err(_) => return false,
        };

        match &frame.network {
            NetworkLayer::Arp(arp) if arp.is_request() && self.catalogue.is_anycast_ip(arp.target_ip) => {
                self.answer_arp(packet, arp);
                true
            }
            NetworkLayer::Ipv4(ip) if self.catalogue.is_anycast_ip(ip.dst) => {
                match &ip.transport {
                    TransportLayer::Icmp(icmp) if icmp.is_echo_request() => self.answer_echo(packet, &frame),
                    TransportLayer::Tcp { dst_port, .. } => {
                        self.service_packet(packet, ip.src, ServiceId::tcp(ip.dst, *dst_port))
                    }
                    TransportLayer::Udp { dst_port, .. } => {
                        self.service_packet(packet, ip.src, ServiceId::udp(ip.dst, *dst_port))
                    }
                    other => {
                        debug!(dpid = packet.dpid, protocol = other.protocol(), "Ignoring anycast packet");
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Reply with the sentinel MAC; the anycast address never resolves to an instance
    fn answer_arp(&self, packet: &PacketIn, arp: &ArpPacket) {
        let reply = EthernetFrame::arp_reply_to(arp, self.sentinel_mac).encode();
        match self.southbound.packet_out(packet.dpid, PacketOut::inject(packet.in_port, reply)) {
            Ok(()) => debug!(
                dpid = packet.dpid,
                in_port = packet.in_port,
                requester = %arp.sender_ip,
                anycast = %arp.target_ip,
                "Answered anycast ARP request"
            ),
            Err(e) => warn!(dpid = packet.dpid, error = %e, "Failed to send anycast ARP reply"),
        }
    }

    fn answer_echo(&self, packet: &PacketIn, frame: &EthernetFrame) {
        let Some(reply) = frame.echo_reply() else {
            return;
        };
        match self
            .southbound
            .packet_out(packet.dpid, PacketOut::inject(packet.in_port, reply.encode()))
        {
            Ok(()) => debug!(dpid = packet.dpid, in_port = packet.in_port, "Answered anycast echo request"),
            Err(e) => warn!(dpid = packet.dpid, error = %e, "Failed to send anycast echo reply"),
        }
    }

    fn service_packet(&self, packet: &PacketIn, client: Ipv4Addr, service: ServiceId) {
        if let Err(e) = self.dispatch_flow(packet, client, service) {
            match e {
                AnycastError::UnknownService(_) | AnycastError::UnknownIngress(_) | AnycastError::NoEntry { .. } => {
                    debug!(dpid = packet.dpid, client = %client, error = %e, "Anycast packet dropped")
                }
                AnycastError::InstanceUnresolved(_) | AnycastError::NoOutputPort { .. } => {
                    info!(dpid = packet.dpid, client = %client, service = %service, error = %e, "Instance not reachable yet")
                }
                _ => warn!(dpid = packet.dpid, client = %client, service = %service, error = %e, "Anycast install failed"),
            }
        }
    }

    /// Idle -> installed for the flow this packet starts
    fn dispatch_flow(&self, packet: &PacketIn, client: Ipv4Addr, service: ServiceId) -> AnycastResult<()> {
        let policy = self
            .policies
            .get(&service)
            .ok_or(AnycastError::UnknownService(service))?;
        let index = self
            .ingress_index(packet.dpid)
            .ok_or(AnycastError::UnknownIngress(packet.dpid))?;
        policy.refresh_if_due();
        let matrix = policy.current();

        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&(packet.dpid, service))
            .ok_or(AnycastError::NoEntry {
                dpid: packet.dpid,
                service,
            })?;

        // Punted before the installed rule took effect: replay only
        let flow = forward_match(service, packet.in_port, client);
        if entry.state() == EntryState::Installed && entry.forward_match() == Some(&flow) {
            if let Some(installed) = entry.installed() {
                debug!(dpid = packet.dpid, service = %service, "Flow already installed, replaying packet");
                return self.replay(packet, installed.rules.forward.actions.clone());
            }
        }

        let row = matrix.row(index).ok_or(AnycastError::EmptyDispatch(service))?;
        let target = {
            let mut rng = self.rng.lock();
            entry.advance(row, &mut *rng)
        }
        .ok_or(AnycastError::EmptyDispatch(service))?;
        self.count_dispatch(target);

        let rules = self.program(entry, packet.in_port, client, target)?;
        self.replay(packet, rules.forward.actions)
    }

    /// Write forward then reverse rule and pin the target
    fn program(
        &self,
        entry: &mut CpnForwardingEntry,
        in_port: PortNo,
        client: Ipv4Addr,
        target: ServiceInstance,
    ) -> AnycastResult<RewriteRules> {
        let dpid = entry.dpid();
        let instance_mac = self
            .topology
            .host_mac(target.ip)
            .ok_or(AnycastError::InstanceUnresolved(target.ip))?;
        let out_port = self
            .forwarding
            .get_output_port(dpid, target.ip)
            .ok_or(AnycastError::NoOutputPort { dpid, ip: target.ip })?;

        let rewrite = RewriteTarget {
            service: entry.service(),
            in_port,
            client,
            instance: target,
            instance_mac,
            out_port,
        };
        let rules = RewriteRules::build(&rewrite, self.sentinel_mac, &self.flow);
        self.southbound.flow_mod(dpid, rules.forward.clone())?;
        self.southbound.flow_mod(dpid, rules.reverse.clone())?;

        info!(
            dpid = dpid,
            service = %entry.service(),
            client = %client,
            instance = %target,
            out_port = out_port,
            "Anycast rules installed"
        );
        entry.record_install(InstalledRules {
            rules: rules.clone(),
            in_port,
            client,
            target,
            installed_at: Instant::now(),
        });
        Ok(rules)
    }

    /// Send the triggering packet through the forward actions
    fn replay(&self, packet: &PacketIn, actions: Vec<FlowAction>) -> AnycastResult<()> {
        match PacketOut::new(packet.buffer_id, packet.in_port, actions, Some(packet.data.clone())) {
            Some(out) => self.southbound.packet_out(packet.dpid, out)?,
            None => debug!(dpid = packet.dpid, "Nothing to replay"),
        }
        Ok(())
    }

    // ========== Flow removal ==========

    /// Installed -> idle when the entry's own forward rule aged out.
    ///
    /// Returns true if an entry changed state.
    pub fn handle_flow_removed(&self, removed: &FlowRemoved) -> bool {
        let Some(service) = Self::service_of(&removed.flow_match) else {
            return false;
        };
        let mut entries = self.entries.lock();
        match entries.get_mut(&(removed.dpid, service)) {
            Some(entry) if entry.is_own_forward_rule(&removed.flow_match) => {
                entry.mark_idle();
                info!(
                    dpid = removed.dpid,
                    service = %service,
                    reason = ?removed.reason,
                    packets = removed.packet_count,
                    "Anycast forward rule removed"
                );
                true
            }
            _ => {
                debug!(dpid = removed.dpid, service = %service, "Ignoring foreign flow removal");
                false
            }
        }
    }

    fn service_of(flow_match: &FlowMatch) -> Option<ServiceId> {
        let ip = flow_match.ipv4_dst?;
        match TransportProtocol::from_ip_proto(flow_match.ip_proto?)? {
            TransportProtocol::Tcp => Some(ServiceId::tcp(ip, flow_match.tcp_dst?)),
            TransportProtocol::Udp => Some(ServiceId::udp(ip, flow_match.udp_dst?)),
        }
    }

    // ========== Policy tick ==========

    /// Recompute every policy and move installed entries whose next target
    /// changed.
    ///
    /// Returns how many entries were reprogrammed.
    pub fn refresh_policy_tick(&self) -> usize {
        let mut reprogrammed = 0;
        for (service, policy) in &self.policies {
            let matrix = policy.compute_policy();
            let mut entries = self.entries.lock();
            for (&(dpid, entry_service), entry) in entries.iter_mut() {
                if entry_service != *service || entry.state() != EntryState::Installed {
                    continue;
                }
                let (Some(index), Some(installed)) = (self.ingress_index(dpid), entry.installed()) else {
                    continue;
                };
                let Some(row) = matrix.row(index) else {
                    continue;
                };
                let (in_port, client, current) = (installed.in_port, installed.client, installed.target);

                let next = {
                    let mut rng = self.rng.lock();
                    entry.advance(row, &mut *rng)
                };
                let Some(next) = next else {
                    continue;
                };
                self.count_dispatch(next);
                if next == current {
                    debug!(dpid = dpid, service = %service, instance = %current, "Dispatch target unchanged");
                    continue;
                }

                match self.program(entry, in_port, client, next) {
                    Ok(_) => reprogrammed += 1,
                    Err(e) => warn!(dpid = dpid, service = %service, error = %e, "Policy reinstall failed"),
                }
            }
        }
        if reprogrammed > 0 {
            info!(entries = reprogrammed, "Anycast entries moved by policy refresh");
        }
        reprogrammed
    }
}
