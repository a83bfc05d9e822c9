//! Bandwidth monitor
//!
//! Polls port descriptions, port counters and flow counters, turns
//! consecutive samples into byte rates and writes each link's free
//! bandwidth onto the topology graph. Also keeps the widest-path table
//! used by the bandwidth metric.

use cpn_core::MonitorConfig;
use cpn_types::{
    Dpid, FlowStats, PortDesc, PortNo, PortStats, Southbound, SouthboundMessage, PORT_LOCAL,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::awareness::TopologyStore;
use crate::graph::{widest_path, MAX_CAPACITY, SWITCH_INTERIOR_BANDWIDTH};

/// Flow counter key: (in_port, ipv4_dst, out_port)
pub type FlowKey = (Option<PortNo>, Option<Ipv4Addr>, Option<PortNo>);

/// Rated port properties from a port-description reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFeature {
    pub config: u32,
    pub state: u32,
    /// Rated speed in kbit/s
    pub curr_speed: u64,
}

/// Bottleneck bandwidth and widest path for every switch pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidestPaths {
    pub capabilities: BTreeMap<Dpid, BTreeMap<Dpid, f64>>,
    pub best_paths: BTreeMap<Dpid, BTreeMap<Dpid, Vec<Dpid>>>,
}

impl WidestPaths {
    pub fn path(&self, src: Dpid, dst: Dpid) -> Option<&Vec<Dpid>> {
        self.best_paths.get(&src).and_then(|m| m.get(&dst))
    }

    pub fn capability(&self, src: Dpid, dst: Dpid) -> Option<f64> {
        self.capabilities.get(&src).and_then(|m| m.get(&dst)).copied()
    }
}

#[derive(Debug, Clone, Copy)]
struct PortSample {
    tx_bytes: u64,
    rx_bytes: u64,
    time: f64,
}

#[derive(Debug, Clone, Copy)]
struct FlowSample {
    byte_count: u64,
    time: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    port_stats: HashMap<(Dpid, PortNo), VecDeque<PortSample>>,
    port_speed: HashMap<(Dpid, PortNo), VecDeque<f64>>,
    flow_stats: HashMap<Dpid, HashMap<FlowKey, VecDeque<FlowSample>>>,
    flow_speed: HashMap<Dpid, HashMap<FlowKey, VecDeque<f64>>>,
    port_features: HashMap<Dpid, HashMap<PortNo, PortFeature>>,
    free_bandwidth: HashMap<Dpid, HashMap<PortNo, f64>>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, len: usize) {
    queue.push_back(value);
    while queue.len() > len {
        queue.pop_front();
    }
}

/// Byte rate between two counter readings
pub fn rate(now: u64, pre: u64, period: f64) -> f64 {
    if period > 0.0 {
        (now as f64 - pre as f64) / period
    } else {
        0.0
    }
}

/// Free bandwidth in Mbit/s from rated capacity (kbit/s) and throughput (bytes/s)
pub fn free_bandwidth_mbps(capacity_kbps: u64, speed_bytes: f64) -> f64 {
    (capacity_kbps as f64 / 1e3 - speed_bytes * 8.0 / 1e6).max(0.0)
}

fn timestamp(sec: u32, nsec: u32) -> f64 {
    f64::from(sec) + f64::from(nsec) / 1e9
}

/// Bandwidth monitor
pub struct BandwidthMonitor {
    topology: Arc<TopologyStore>,
    southbound: Arc<dyn Southbound>,
    history_len: usize,
    /// Period assumed for the very first sample
    period: f64,
    forwarding_priority: u16,
    state: RwLock<MonitorState>,
    widest: RwLock<Option<Arc<WidestPaths>>>,
}

impl BandwidthMonitor {
    pub fn new(
        topology: Arc<TopologyStore>,
        southbound: Arc<dyn Southbound>,
        config: &MonitorConfig,
        forwarding_priority: u16,
    ) -> Self {
        Self {
            topology,
            southbound,
            history_len: config.history_len.max(2),
            period: config.bandwidth_period_secs,
            forwarding_priority,
            state: RwLock::new(MonitorState::default()),
            widest: RwLock::new(None),
        }
    }

    /// Ask every connected switch for port descriptions and counters.
    ///
    /// The widest-path table is dropped; it is rebuilt on next use.
    pub fn request_stats(&self) -> usize {
        let switches = self.southbound.connected();
        for &dpid in &switches {
            debug!(dpid = dpid, "Sending stats requests");
            for message in [
                SouthboundMessage::PortDescRequest,
                SouthboundMessage::PortStatsRequest,
                SouthboundMessage::FlowStatsRequest,
            ] {
                if let Err(e) = self.southbound.send(dpid, message) {
                    warn!(dpid = dpid, error = %e, "Stats request failed");
                }
            }
        }
        *self.widest.write() = None;
        switches.len()
    }

    pub fn on_port_desc_reply(&self, dpid: Dpid, ports: &[PortDesc]) {
        let mut state = self.state.write();
        let features = state.port_features.entry(dpid).or_default();
        for port in ports {
            debug!(dpid = dpid, port = port.port_no, speed_kbps = port.curr_speed, "Port description");
            features.insert(
                port.port_no,
                PortFeature {
                    config: port.config,
                    state: port.state,
                    curr_speed: port.curr_speed,
                },
            );
        }
    }

    pub fn on_port_stats_reply(&self, dpid: Dpid, stats: &[PortStats]) {
        let mut sorted: Vec<&PortStats> = stats.iter().filter(|s| s.port_no != PORT_LOCAL).collect();
        sorted.sort_by_key(|s| s.port_no);

        let mut state = self.state.write();
        for stat in sorted {
            let key = (dpid, stat.port_no);
            let sample = PortSample {
                tx_bytes: stat.tx_bytes,
                rx_bytes: stat.rx_bytes,
                time: timestamp(stat.duration_sec, stat.duration_nsec),
            };
            let history = state.port_stats.entry(key).or_default();
            push_bounded(history, sample, self.history_len);

            let (pre, period) = match history.len() {
                n if n > 1 => {
                    let prev = history[n - 2];
                    (prev.tx_bytes + prev.rx_bytes, sample.time - prev.time)
                }
                _ => (0, self.period),
            };
            let speed = rate(sample.tx_bytes + sample.rx_bytes, pre, period);
            push_bounded(state.port_speed.entry(key).or_default(), speed, self.history_len);

            let capacity = state
                .port_features
                .get(&dpid)
                .and_then(|f| f.get(&stat.port_no))
                .map(|f| f.curr_speed);
            match capacity {
                Some(capacity) => {
                    state
                        .free_bandwidth
                        .entry(dpid)
                        .or_default()
                        .insert(stat.port_no, free_bandwidth_mbps(capacity, speed));
                }
                None => info!(dpid = dpid, port = stat.port_no, "Port state unknown, free bandwidth not updated"),
            }
        }
    }

    /// Only forwarding-priority rules are tracked
    pub fn on_flow_stats_reply(&self, dpid: Dpid, stats: &[FlowStats]) {
        let mut flows: Vec<&FlowStats> = stats
            .iter()
            .filter(|f| f.priority == self.forwarding_priority)
            .collect();
        flows.sort_by_key(|f| (f.flow_match.in_port, f.flow_match.ipv4_dst));

        let mut state = self.state.write();
        for flow in flows {
            let out_port = flow.actions.iter().find_map(|a| a.output_port());
            let key: FlowKey = (flow.flow_match.in_port, flow.flow_match.ipv4_dst, out_port);
            let sample = FlowSample {
                byte_count: flow.byte_count,
                time: timestamp(flow.duration_sec, flow.duration_nsec),
            };
            let history = state.flow_stats.entry(dpid).or_default().entry(key).or_default();
            push_bounded(history, sample, self.history_len);

            let (pre, period) = match history.len() {
                n if n > 1 => {
                    let prev = history[n - 2];
                    (prev.byte_count, sample.time - prev.time)
                }
                _ => (0, self.period),
            };
            let speed = rate(sample.byte_count, pre, period);
            push_bounded(
                state.flow_speed.entry(dpid).or_default().entry(key).or_default(),
                speed,
                self.history_len,
            );
        }
    }

    /// Write free bandwidth onto every link edge.
    ///
    /// An edge takes the smaller of its two endpoint ports, or 0 when
    /// either reading is missing.
    pub fn save_bandwidth_graph(&self) {
        let links = self.topology.links();
        let assignments: Vec<(Dpid, Dpid, f64)> = {
            let state = self.state.read();
            links
                .iter()
                .map(|&((src, dst), (src_port, dst_port))| {
                    let src_bw = state.free_bandwidth.get(&src).and_then(|m| m.get(&src_port));
                    let dst_bw = state.free_bandwidth.get(&dst).and_then(|m| m.get(&dst_port));
                    let bw = match (src_bw, dst_bw) {
                        (Some(a), Some(b)) => a.min(*b),
                        _ => 0.0,
                    };
                    (src, dst, bw)
                })
                .collect()
        };

        for dpid in self.topology.switches() {
            self.topology.set_edge_bandwidth(dpid, dpid, SWITCH_INTERIOR_BANDWIDTH);
        }
        for (src, dst, bw) in assignments {
            self.topology.set_edge_bandwidth(src, dst, bw);
        }
        debug!(links = links.len(), "Free bandwidth saved to graph");
    }

    /// Widest path for every cached switch pair, built lazily
    pub fn best_paths(&self) -> Arc<WidestPaths> {
        if let Some(table) = self.widest.read().as_ref() {
            return table.clone();
        }
        let table = Arc::new(self.compute_widest_paths());
        *self.widest.write() = Some(table.clone());
        table
    }

    pub fn best_path(&self, src: Dpid, dst: Dpid) -> Option<Vec<Dpid>> {
        self.best_paths().path(src, dst).cloned()
    }

    fn compute_widest_paths(&self) -> WidestPaths {
        let graph = self.topology.graph();
        let paths = self.topology.paths();
        let mut table = WidestPaths::default();
        for (src, dst, candidates) in paths.iter() {
            if src == dst {
                table.best_paths.entry(src).or_default().insert(src, vec![src]);
                table.capabilities.entry(src).or_default().insert(src, MAX_CAPACITY);
                continue;
            }
            if let Some((bw, path)) = widest_path(&graph, candidates) {
                table.best_paths.entry(src).or_default().insert(dst, path.clone());
                table.capabilities.entry(src).or_default().insert(dst, bw);
            }
        }
        table
    }

    pub fn invalidate_best_paths(&self) {
        *self.widest.write() = None;
    }

    pub fn free_bandwidth(&self, dpid: Dpid, port: PortNo) -> Option<f64> {
        self.state
            .read()
            .free_bandwidth
            .get(&dpid)
            .and_then(|m| m.get(&port))
            .copied()
    }

    /// Latest port byte rate
    pub fn port_speed(&self, dpid: Dpid, port: PortNo) -> Option<f64> {
        self.state
            .read()
            .port_speed
            .get(&(dpid, port))
            .and_then(|q| q.back())
            .copied()
    }

    /// Latest flow byte rate
    pub fn flow_speed(&self, dpid: Dpid, key: &FlowKey) -> Option<f64> {
        self.state
            .read()
            .flow_speed
            .get(&dpid)
            .and_then(|m| m.get(key))
            .and_then(|q| q.back())
            .copied()
    }

    pub fn port_feature(&self, dpid: Dpid, port: PortNo) -> Option<PortFeature> {
        self.state
            .read()
            .port_features
            .get(&dpid)
            .and_then(|m| m.get(&port))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpn_types::{FlowAction, FlowMatch, Link, PathMetric, RecordingSouthbound};

    fn port_stats(port_no: PortNo, tx: u64, rx: u64, sec: u32) -> PortStats {
        PortStats {
            port_no,
            tx_bytes: tx,
            rx_bytes: rx,
            rx_errors: 0,
            duration_sec: sec,
            duration_nsec: 0,
        }
    }

    fn desc(port_no: PortNo, curr_speed: u64) -> PortDesc {
        PortDesc {
            port_no,
            config: 0,
            state: 0,
            curr_speed,
        }
    }

    fn setup() -> (Arc<RecordingSouthbound>, Arc<TopologyStore>, BandwidthMonitor) {
        let sb = Arc::new(RecordingSouthbound::new());
        let topo = Arc::new(TopologyStore::new(PathMetric::Bandwidth, 2, sb.clone()));
        topo.on_switch_enter(1, &[1, 2]);
        topo.on_switch_enter(2, &[1, 2]);
        topo.on_switch_enter(3, &[1, 2]);
        topo.on_link_add(Link::new(1, 2, 2, 1));
        topo.on_link_add(Link::new(2, 2, 3, 1));
        topo.refresh_paths();
        let monitor = BandwidthMonitor::new(topo.clone(), sb.clone(), &MonitorConfig::default(), 1);
        (sb, topo, monitor)
    }

    #[test]
    fn test_free_bandwidth_formula() {
        // 10 Mbit/s port, 500 kB/s observed -> 10 - 4 = 6 Mbit/s
        assert!((free_bandwidth_mbps(10_000, 500_000.0) - 6.0).abs() < 1e-9);
        assert_eq!(free_bandwidth_mbps(1_000, 1e9), 0.0);
    }

    #[test]
    fn test_request_stats_per_switch() {
        let (sb, _topo, monitor) = setup();
        sb.take();
        assert_eq!(monitor.request_stats(), 3);
        assert_eq!(sb.len(), 9);
    }

    #[test]
    fn test_port_speed_from_consecutive_samples() {
        let (_sb, _topo, monitor) = setup();
        monitor.on_port_desc_reply(1, &[desc(2, 10_000)]);
        monitor.on_port_stats_reply(1, &[port_stats(2, 1_000, 1_000, 10)]);
        // First sample: whole counter over the configured period
        assert!((monitor.port_speed(1, 2).unwrap() - 100.0).abs() < 1e-9);

        monitor.on_port_stats_reply(1, &[port_stats(2, 251_000, 251_000, 11)]);
        assert!((monitor.port_speed(1, 2).unwrap() - 500_000.0).abs() < 1e-9);
        assert!((monitor.free_bandwidth(1, 2).unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_local_port_ignored() {
        let (_sb, _topo, monitor) = setup();
        monitor.on_port_stats_reply(1, &[port_stats(PORT_LOCAL, 5, 5, 1)]);
        assert!(monitor.port_speed(1, PORT_LOCAL).is_none());
    }

    #[test]
    fn test_edge_bandwidth_is_min_of_endpoints() {
        let (_sb, topo, monitor) = setup();
        monitor.on_port_desc_reply(1, &[desc(2, 10_000)]);
        monitor.on_port_desc_reply(2, &[desc(1, 5_000), desc(2, 8_000)]);
        monitor.on_port_stats_reply(1, &[port_stats(2, 0, 0, 1)]);
        monitor.on_port_stats_reply(2, &[port_stats(1, 0, 0, 1), port_stats(2, 0, 0, 1)]);
        monitor.save_bandwidth_graph();

        assert_eq!(topo.edge(1, 2).unwrap().bandwidth, Some(5.0));
        assert_eq!(topo.edge(2, 1).unwrap().bandwidth, Some(5.0));
        // switch 3 never reported
        assert_eq!(topo.edge(2, 3).unwrap().bandwidth, Some(0.0));
        assert_eq!(topo.edge(1, 1).unwrap().bandwidth, Some(SWITCH_INTERIOR_BANDWIDTH));
    }

    #[test]
    fn test_widest_path_table() {
        let (_sb, topo, monitor) = setup();
        topo.set_edge_bandwidth(1, 2, 10.0);
        topo.set_edge_bandwidth(2, 3, 5.0);

        let table = monitor.best_paths();
        assert_eq!(table.capability(1, 3), Some(5.0));
        assert_eq!(table.path(1, 3), Some(&vec![1, 2, 3]));
        assert_eq!(table.capability(2, 2), Some(MAX_CAPACITY));

        // Cached until the next polling round
        topo.set_edge_bandwidth(2, 3, 1.0);
        assert_eq!(monitor.best_paths().capability(1, 3), Some(5.0));
        monitor.request_stats();
        assert_eq!(monitor.best_paths().capability(1, 3), Some(1.0));
    }

    #[test]
    fn test_flow_stats_keyed_by_ports_and_destination() {
        let (_sb, _topo, monitor) = setup();
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let flow = |bytes: u64, sec: u32, priority: u16| FlowStats {
            priority,
            flow_match: FlowMatch::ipv4(Ipv4Addr::new(10, 0, 0, 1), dst).with_in_port(1),
            actions: vec![FlowAction::output(2)],
            packet_count: 0,
            byte_count: bytes,
            duration_sec: sec,
            duration_nsec: 0,
        };
        monitor.on_flow_stats_reply(1, &[flow(1_000, 1, 1), flow(99, 1, 0x9000)]);
        monitor.on_flow_stats_reply(1, &[flow(3_000, 3, 1)]);

        let key: FlowKey = (Some(1), Some(dst), Some(2));
        assert!((monitor.flow_speed(1, &key).unwrap() - 1_000.0).abs() < 1e-9);
    }
}
