//! Topology store
//!
//! Owns the switch/port/link maps, the host access table, the switch graph
//! and the k-shortest path cache. Topology events only mark the cache
//! dirty; `refresh_paths` rebuilds it on the discovery cadence so bursts of
//! events cost a single recomputation.

use cpn_types::{
    Dpid, FlowAction, FlowMatch, FlowMod, Link, MacAddr, PathMetric, PortNo, PortReason,
    Southbound, PORT_CONTROLLER,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::graph::{EdgeAttrs, TopologyGraph};

/// Host bound to an access port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// src -> dst -> up to k paths, shortest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathCache {
    paths: BTreeMap<Dpid, BTreeMap<Dpid, Vec<Vec<Dpid>>>>,
}

impl PathCache {
    pub fn get(&self, src: Dpid, dst: Dpid) -> Option<&Vec<Vec<Dpid>>> {
        self.paths.get(&src).and_then(|m| m.get(&dst))
    }

    pub fn first(&self, src: Dpid, dst: Dpid) -> Option<&Vec<Dpid>> {
        self.get(src, dst).and_then(|p| p.first())
    }

    pub fn insert(&mut self, src: Dpid, dst: Dpid, paths: Vec<Vec<Dpid>>) {
        self.paths.entry(src).or_default().insert(dst, paths);
    }

    /// Every (src, dst, candidates) entry
    pub fn iter(&self) -> impl Iterator<Item = (Dpid, Dpid, &Vec<Vec<Dpid>>)> + '_ {
        self.paths
            .iter()
            .flat_map(|(src, m)| m.iter().map(move |(dst, p)| (*src, *dst, p)))
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Default)]
struct TopologyState {
    switch_ports: BTreeMap<Dpid, BTreeSet<PortNo>>,
    interior_ports: BTreeMap<Dpid, BTreeSet<PortNo>>,
    /// (src, dst) -> (src_port, dst_port)
    link_to_port: BTreeMap<(Dpid, Dpid), (PortNo, PortNo)>,
    access_table: BTreeMap<(Dpid, PortNo), HostRecord>,
    graph: TopologyGraph,
}

impl TopologyState {
    fn is_access_port(&self, dpid: Dpid, port: PortNo) -> bool {
        let known = self
            .switch_ports
            .get(&dpid)
            .map_or(false, |ports| ports.contains(&port));
        let interior = self
            .interior_ports
            .get(&dpid)
            .map_or(false, |ports| ports.contains(&port));
        known && !interior
    }

    fn rebuild_interior_ports(&mut self) {
        let mut interior: BTreeMap<Dpid, BTreeSet<PortNo>> = BTreeMap::new();
        for (&(src, dst), &(src_port, dst_port)) in &self.link_to_port {
            interior.entry(src).or_default().insert(src_port);
            interior.entry(dst).or_default().insert(dst_port);
        }
        self.interior_ports = interior;
    }
}

/// Topology store
pub struct TopologyStore {
    state: RwLock<TopologyState>,
    paths: RwLock<Arc<PathCache>>,
    dirty: AtomicBool,
    metric: PathMetric,
    k_paths: usize,
    southbound: Arc<dyn Southbound>,
}

impl TopologyStore {
    pub fn new(metric: PathMetric, k_paths: usize, southbound: Arc<dyn Southbound>) -> Self {
        Self {
            state: RwLock::new(TopologyState::default()),
            paths: RwLock::new(Arc::new(PathCache::default())),
            dirty: AtomicBool::new(false),
            metric,
            k_paths: k_paths.max(1),
            southbound,
        }
    }

    pub fn metric(&self) -> PathMetric {
        self.metric
    }

    pub fn k_paths(&self) -> usize {
        self.k_paths
    }

    // ========== Topology events ==========

    /// A switch connected: record its ports and install the table-miss rule
    pub fn on_switch_enter(&self, dpid: Dpid, ports: &[PortNo]) {
        info!(dpid = dpid, ports = ports.len(), "Switch connected");
        {
            let mut state = self.state.write();
            state
                .switch_ports
                .entry(dpid)
                .or_default()
                .extend(ports.iter().copied());
            state.graph.add_node(dpid);
        }
        self.southbound.attach(dpid);
        self.mark_dirty();

        let table_miss = FlowMod::new(0, FlowMatch::any(), vec![FlowAction::output(PORT_CONTROLLER)]);
        if let Err(e) = self.southbound.flow_mod(dpid, table_miss) {
            warn!(dpid = dpid, error = %e, "Failed to install table-miss rule");
        }
    }

    pub fn on_switch_leave(&self, dpid: Dpid) {
        info!(dpid = dpid, "Switch disconnected");
        {
            let mut state = self.state.write();
            state.switch_ports.remove(&dpid);
            state
                .link_to_port
                .retain(|(src, dst), _| *src != dpid && *dst != dpid);
            state.access_table.retain(|(sw, _), _| *sw != dpid);
            state.rebuild_interior_ports();
            state.graph.remove_node(dpid);
        }
        self.southbound.detach(dpid);
        self.mark_dirty();
    }

    pub fn on_port_status(&self, dpid: Dpid, port: PortNo, reason: PortReason) {
        info!(dpid = dpid, port = port, reason = ?reason, "Port status changed");
        {
            let mut state = self.state.write();
            match reason {
                PortReason::Add | PortReason::Modify => {
                    state.switch_ports.entry(dpid).or_default().insert(port);
                }
                PortReason::Delete => {
                    if let Some(ports) = state.switch_ports.get_mut(&dpid) {
                        ports.remove(&port);
                    }
                    state.access_table.remove(&(dpid, port));
                }
            }
        }
        self.mark_dirty();
    }

    /// A link came up; both directions are recorded
    pub fn on_link_add(&self, link: Link) {
        debug!(
            src = link.src,
            src_port = link.src_port,
            dst = link.dst,
            dst_port = link.dst_port,
            "Link added"
        );
        {
            let mut state = self.state.write();
            for l in [link, link.reversed()] {
                state.link_to_port.insert((l.src, l.dst), (l.src_port, l.dst_port));
                state.switch_ports.entry(l.src).or_default().insert(l.src_port);
                state.graph.add_edge(l.src, l.dst);
                // A port that turned interior no longer hosts anything
                state.access_table.remove(&(l.src, l.src_port));
            }
            state.rebuild_interior_ports();
        }
        self.mark_dirty();
    }

    pub fn on_link_delete(&self, link: Link) {
        debug!(src = link.src, dst = link.dst, "Link deleted");
        {
            let mut state = self.state.write();
            for l in [link, link.reversed()] {
                state.link_to_port.remove(&(l.src, l.dst));
                state.graph.remove_edge(l.src, l.dst);
            }
            state.rebuild_interior_ports();
        }
        self.mark_dirty();
    }

    /// Learn a host from an ARP source address.
    ///
    /// Only access ports are recorded. Returns true if the table changed.
    pub fn on_host_sighting(&self, dpid: Dpid, port: PortNo, ip: Ipv4Addr, mac: MacAddr) -> bool {
        let mut state = self.state.write();
        if !state.is_access_port(dpid, port) {
            return false;
        }
        let record = HostRecord { ip, mac };
        match state.access_table.insert((dpid, port), record) {
            Some(previous) if previous == record => false,
            Some(previous) => {
                info!(dpid = dpid, port = port, old_ip = %previous.ip, ip = %ip, mac = %mac, "Host record updated");
                true
            }
            None => {
                info!(dpid = dpid, port = port, ip = %ip, mac = %mac, "Host learned");
                true
            }
        }
    }

    // ========== Queries ==========

    /// (switch, access port) a host is attached to
    pub fn resolve_host(&self, ip: Ipv4Addr) -> Option<(Dpid, PortNo)> {
        self.state
            .read()
            .access_table
            .iter()
            .find(|(_, record)| record.ip == ip)
            .map(|(key, _)| *key)
    }

    pub fn host_mac(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.state
            .read()
            .access_table
            .values()
            .find(|record| record.ip == ip)
            .map(|record| record.mac)
    }

    pub fn host_at(&self, dpid: Dpid, port: PortNo) -> Option<HostRecord> {
        self.state.read().access_table.get(&(dpid, port)).copied()
    }

    pub fn is_access_port(&self, dpid: Dpid, port: PortNo) -> bool {
        self.state.read().is_access_port(dpid, port)
    }

    /// Access ports of every switch, ascending
    pub fn access_ports(&self) -> Vec<(Dpid, PortNo)> {
        let state = self.state.read();
        state
            .switch_ports
            .iter()
            .flat_map(|(dpid, ports)| ports.iter().map(move |p| (*dpid, *p)))
            .filter(|(dpid, port)| state.is_access_port(*dpid, *port))
            .collect()
    }

    /// (src_port, dst_port) of the link src -> dst
    pub fn link_ports(&self, src: Dpid, dst: Dpid) -> Option<(PortNo, PortNo)> {
        self.state.read().link_to_port.get(&(src, dst)).copied()
    }

    /// Directed links with their port pairs
    pub fn links(&self) -> Vec<((Dpid, Dpid), (PortNo, PortNo))> {
        self.state
            .read()
            .link_to_port
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    pub fn switches(&self) -> Vec<Dpid> {
        self.state.read().switch_ports.keys().copied().collect()
    }

    pub fn switch_count(&self) -> usize {
        self.state.read().switch_ports.len()
    }

    pub fn hosts(&self) -> Vec<((Dpid, PortNo), HostRecord)> {
        self.state
            .read()
            .access_table
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// Copy of the graph for path computations
    pub fn graph(&self) -> TopologyGraph {
        self.state.read().graph.clone()
    }

    pub fn edge(&self, src: Dpid, dst: Dpid) -> Option<EdgeAttrs> {
        self.state.read().graph.edge(src, dst).copied()
    }

    // ========== Edge annotation ==========

    pub fn set_edge_bandwidth(&self, src: Dpid, dst: Dpid, bandwidth: f64) {
        if let Some(edge) = self.state.write().graph.edge_mut(src, dst) {
            edge.bandwidth = Some(bandwidth);
        }
    }

    pub fn set_edge_delay(&self, src: Dpid, dst: Dpid, delay: f64) {
        if let Some(edge) = self.state.write().graph.edge_mut(src, dst) {
            edge.delay = Some(delay);
        }
    }

    pub fn set_probe_delay(&self, src: Dpid, dst: Dpid, delay: f64) {
        if let Some(edge) = self.state.write().graph.edge_mut(src, dst) {
            edge.probe_delay = Some(delay);
        }
    }

    // ========== Path cache ==========

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Current path cache
    pub fn paths(&self) -> Arc<PathCache> {
        self.paths.read().clone()
    }

    /// Rebuild the path cache if topology changed since the last rebuild
    pub fn refresh_paths(&self) -> bool {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.recompute_all_pairs(self.candidate_metric(), self.k_paths);
        true
    }

    /// Rebuild the whole cache and publish it atomically
    pub fn recompute_all_pairs(&self, metric: PathMetric, k: usize) {
        let graph = self.graph();
        let mut cache = PathCache::default();
        for src in graph.nodes() {
            for dst in graph.nodes() {
                let paths = graph.k_shortest_paths(src, dst, metric, k);
                if paths.is_empty() {
                    debug!(src = src, dst = dst, "No path between switches");
                    continue;
                }
                cache.insert(src, dst, paths);
            }
        }
        info!(switches = graph.node_count(), metric = %metric, k = k, "Path cache rebuilt");
        *self.paths.write() = Arc::new(cache);
    }

    /// Compute one pair on demand and add it to the cache
    pub fn compute_and_cache(&self, src: Dpid, dst: Dpid, metric: PathMetric, k: usize) -> Vec<Vec<Dpid>> {
        let paths = self.graph().k_shortest_paths(src, dst, metric, k);
        if !paths.is_empty() {
            let mut guard = self.paths.write();
            let mut cache = (**guard).clone();
            cache.insert(src, dst, paths.clone());
            *guard = Arc::new(cache);
        }
        paths
    }

    /// Drop every cached path; they are recomputed on demand
    pub fn invalidate_paths(&self) {
        *self.paths.write() = Arc::new(PathCache::default());
    }

    /// Metric the cached candidates are ranked by
    fn candidate_metric(&self) -> PathMetric {
        match self.metric {
            PathMetric::Delay => PathMetric::Delay,
            PathMetric::Hop | PathMetric::Bandwidth => PathMetric::Hop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpn_types::RecordingSouthbound;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    fn linear(sb: Arc<RecordingSouthbound>) -> TopologyStore {
        let store = TopologyStore::new(PathMetric::Hop, 1, sb);
        store.on_switch_enter(1, &[1, 2]);
        store.on_switch_enter(2, &[1, 2, 3]);
        store.on_switch_enter(3, &[1, 2]);
        store.on_link_add(Link::new(1, 2, 2, 1));
        store.on_link_add(Link::new(2, 2, 3, 1));
        store
    }

    #[test]
    fn test_switch_enter_installs_table_miss() {
        let sb = Arc::new(RecordingSouthbound::new());
        let store = TopologyStore::new(PathMetric::Hop, 1, sb.clone());
        store.on_switch_enter(9, &[1]);

        let mods = sb.flow_mods();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].0, 9);
        assert_eq!(mods[0].1.priority, 0);
        assert_eq!(mods[0].1.flow_match, FlowMatch::any());
        assert_eq!(mods[0].1.output_port(), Some(PORT_CONTROLLER));
        assert_eq!(sb.connected(), vec![9]);
    }

    #[test]
    fn test_link_makes_ports_interior() {
        let store = linear(Arc::new(RecordingSouthbound::new()));
        assert!(store.is_access_port(1, 1));
        assert!(!store.is_access_port(1, 2));
        assert!(!store.is_access_port(2, 1));
        assert!(!store.is_access_port(2, 2));
        assert!(store.is_access_port(2, 3));
        assert_eq!(store.link_ports(2, 1), Some((1, 2)));
        assert_eq!(store.access_ports(), vec![(1, 1), (2, 3), (3, 2)]);
    }

    #[test]
    fn test_host_learning_only_on_access_ports() {
        let store = linear(Arc::new(RecordingSouthbound::new()));
        let ip = Ipv4Addr::new(10, 0, 0, 1);

        assert!(!store.on_host_sighting(1, 2, ip, mac(1)));
        assert!(store.resolve_host(ip).is_none());

        assert!(store.on_host_sighting(1, 1, ip, mac(1)));
        assert_eq!(store.resolve_host(ip), Some((1, 1)));
        assert!(!store.on_host_sighting(1, 1, ip, mac(1)));

        // Re-sighting with a different MAC updates in place
        assert!(store.on_host_sighting(1, 1, ip, mac(9)));
        assert_eq!(store.host_mac(ip), Some(mac(9)));
        assert_eq!(store.hosts().len(), 1);
    }

    #[test]
    fn test_paths_refresh_on_cadence() {
        let store = linear(Arc::new(RecordingSouthbound::new()));
        assert!(store.paths().is_empty());
        assert!(store.is_dirty());

        assert!(store.refresh_paths());
        assert!(!store.refresh_paths());

        let paths = store.paths();
        assert_eq!(paths.first(1, 3), Some(&vec![1, 2, 3]));
        assert_eq!(paths.first(2, 2), Some(&vec![2]));
    }

    #[test]
    fn test_refresh_keeps_edge_attributes() {
        let store = linear(Arc::new(RecordingSouthbound::new()));
        store.set_edge_bandwidth(1, 2, 42.0);
        store.on_link_add(Link::new(1, 2, 2, 1));
        store.refresh_paths();
        assert_eq!(store.edge(1, 2).unwrap().bandwidth, Some(42.0));
    }

    #[test]
    fn test_switch_leave_cleans_up() {
        let sb = Arc::new(RecordingSouthbound::new());
        let store = linear(sb.clone());
        store.on_host_sighting(3, 2, Ipv4Addr::new(10, 0, 0, 3), mac(3));
        store.on_switch_leave(3);

        assert!(store.resolve_host(Ipv4Addr::new(10, 0, 0, 3)).is_none());
        assert!(store.link_ports(2, 3).is_none());
        assert!(store.is_access_port(2, 2));
        assert_eq!(sb.connected(), vec![1, 2]);

        store.refresh_paths();
        assert!(store.paths().get(1, 3).is_none());
    }

    #[test]
    fn test_compute_and_cache_single_pair() {
        let store = linear(Arc::new(RecordingSouthbound::new()));
        let paths = store.compute_and_cache(1, 3, PathMetric::Hop, 1);
        assert_eq!(paths, vec![vec![1, 2, 3]]);
        assert_eq!(store.paths().first(1, 3), Some(&vec![1, 2, 3]));

        store.invalidate_paths();
        assert!(store.paths().is_empty());
    }
}
