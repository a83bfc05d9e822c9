//! Link delay detector
//!
//! Combines two round-trip measurements per link:
//!
//! ```text
//!   controller ──echo──► switch ──echo──► controller      echo(s)
//!   controller ──► src ──► dst ──► controller             probe(src, dst)
//!
//!   delay(src, dst) = (probe(src, dst) + probe(dst, src) - echo(src) - echo(dst)) / 2
//! ```
//!
//! Missing inputs give an infinite delay so the link is never preferred.

use bytes::{Buf, Bytes};
use cpn_core::MonitorConfig;
use cpn_types::{Dpid, Link, PathMetric, Southbound, SouthboundMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::awareness::TopologyStore;
use crate::graph::SWITCH_INTERIOR_DELAY;

/// One-way link delay from the two probes and two echoes, in seconds
pub fn one_way_delay(
    forward: Option<f64>,
    reverse: Option<f64>,
    echo_src: Option<f64>,
    echo_dst: Option<f64>,
) -> f64 {
    match (forward, reverse, echo_src, echo_dst) {
        (Some(fwd), Some(rev), Some(src), Some(dst)) => ((fwd + rev - src - dst) / 2.0).max(0.0),
        _ => f64::INFINITY,
    }
}

/// Delay detector
pub struct DelayDetector {
    topology: Arc<TopologyStore>,
    southbound: Arc<dyn Southbound>,
    echo_interval: Duration,
    /// Echo payloads carry nanoseconds since this instant
    epoch: Instant,
    echo_latency: RwLock<HashMap<Dpid, f64>>,
}

impl DelayDetector {
    pub fn new(topology: Arc<TopologyStore>, southbound: Arc<dyn Southbound>, config: &MonitorConfig) -> Self {
        Self {
            topology,
            southbound,
            echo_interval: Duration::from_secs_f64(config.echo_interval_secs.max(0.0)),
            epoch: Instant::now(),
            echo_latency: RwLock::new(HashMap::new()),
        }
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Timestamped echo payload
    pub fn echo_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.now_nanos().to_be_bytes())
    }

    /// Send one echo request to every connected switch, pausing between sends
    pub async fn send_echo_requests(&self) -> usize {
        let switches = self.southbound.connected();
        for &dpid in &switches {
            let message = SouthboundMessage::EchoRequest {
                payload: self.echo_payload(),
            };
            if let Err(e) = self.southbound.send(dpid, message) {
                warn!(dpid = dpid, error = %e, "Echo request failed");
            }
            if !self.echo_interval.is_zero() {
                tokio::time::sleep(self.echo_interval).await;
            }
        }
        switches.len()
    }

    /// One detection round: echoes, then link delays from what has arrived so far
    pub async fn probe_round(&self) {
        let sent = self.send_echo_requests().await;
        let links = self.update_link_delays();
        debug!(switches = sent, links = links, "Delay round complete");
    }

    pub fn on_echo_reply(&self, dpid: Dpid, payload: &Bytes) {
        if payload.len() < 8 {
            debug!(dpid = dpid, len = payload.len(), "Echo reply without timestamp");
            return;
        }
        let sent = payload.clone().get_u64();
        let latency = self.now_nanos().saturating_sub(sent) as f64 / 1e9;
        self.echo_latency.write().insert(dpid, latency);
    }

    /// Record a link-discovery round trip; unknown links are ignored
    pub fn on_link_probe(&self, link: &Link, round_trip: Duration) {
        if self.topology.link_ports(link.src, link.dst).is_none() {
            debug!(src = link.src, dst = link.dst, "Probe for unknown link");
            return;
        }
        self.topology
            .set_probe_delay(link.src, link.dst, round_trip.as_secs_f64());
    }

    pub fn echo_latency(&self, dpid: Dpid) -> Option<f64> {
        self.echo_latency.read().get(&dpid).copied()
    }

    pub fn link_delay(&self, src: Dpid, dst: Dpid) -> f64 {
        let forward = self.topology.edge(src, dst).and_then(|e| e.probe_delay);
        let reverse = self.topology.edge(dst, src).and_then(|e| e.probe_delay);
        let echo = self.echo_latency.read();
        one_way_delay(forward, reverse, echo.get(&src).copied(), echo.get(&dst).copied())
    }

    /// Write the delay of every link onto the graph.
    ///
    /// With the delay metric the path cache is dropped so paths are
    /// recomputed with the new weights.
    pub fn update_link_delays(&self) -> usize {
        let links = self.topology.links();
        for &((src, dst), _) in &links {
            let delay = self.link_delay(src, dst);
            if delay.is_infinite() {
                debug!(src = src, dst = dst, "Link delay unavailable");
            }
            self.topology.set_edge_delay(src, dst, delay);
        }
        for dpid in self.topology.switches() {
            self.topology.set_edge_delay(dpid, dpid, SWITCH_INTERIOR_DELAY);
        }
        if self.topology.metric() == PathMetric::Delay {
            self.topology.invalidate_paths();
        }
        links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpn_types::RecordingSouthbound;

    fn setup(metric: PathMetric) -> (Arc<RecordingSouthbound>, Arc<TopologyStore>, DelayDetector) {
        let sb = Arc::new(RecordingSouthbound::new());
        let topo = Arc::new(TopologyStore::new(metric, 1, sb.clone()));
        topo.on_switch_enter(1, &[1, 2]);
        topo.on_switch_enter(2, &[1, 2]);
        topo.on_link_add(Link::new(1, 2, 2, 1));
        let config = MonitorConfig {
            echo_interval_secs: 0.0,
            ..MonitorConfig::default()
        };
        let detector = DelayDetector::new(topo.clone(), sb.clone(), &config);
        (sb, topo, detector)
    }

    #[test]
    fn test_one_way_delay_formula() {
        let d = one_way_delay(Some(0.030), Some(0.034), Some(0.004), Some(0.006));
        assert!((d - 0.027).abs() < 1e-12);
        assert_eq!(one_way_delay(Some(0.001), Some(0.001), Some(0.01), Some(0.01)), 0.0);
        assert!(one_way_delay(None, Some(0.1), Some(0.0), Some(0.0)).is_infinite());
    }

    #[test]
    fn test_missing_echo_gives_infinite_delay() {
        let (_sb, topo, detector) = setup(PathMetric::Hop);
        let link = Link::new(1, 2, 2, 1);
        detector.on_link_probe(&link, Duration::from_millis(20));
        detector.on_link_probe(&link.reversed(), Duration::from_millis(20));
        detector.update_link_delays();

        assert_eq!(topo.edge(1, 2).unwrap().delay, Some(f64::INFINITY));
        assert_eq!(topo.edge(1, 1).unwrap().delay, Some(SWITCH_INTERIOR_DELAY));
    }

    #[test]
    fn test_probe_for_unknown_link_ignored() {
        let (_sb, topo, detector) = setup(PathMetric::Hop);
        detector.on_link_probe(&Link::new(1, 9, 3, 1), Duration::from_millis(5));
        assert!(topo.edge(1, 3).is_none());
    }

    #[test]
    fn test_echo_reply_measures_latency() {
        let (_sb, _topo, detector) = setup(PathMetric::Hop);
        let payload = detector.echo_payload();
        detector.on_echo_reply(1, &payload);
        let latency = detector.echo_latency(1).unwrap();
        assert!(latency >= 0.0 && latency < 1.0);

        detector.on_echo_reply(2, &Bytes::from_static(b"bad"));
        assert!(detector.echo_latency(2).is_none());
    }

    #[tokio::test]
    async fn test_probe_round_sends_echo_per_switch() {
        let (sb, topo, detector) = setup(PathMetric::Delay);
        sb.take();
        topo.refresh_paths();
        assert!(!topo.paths().is_empty());

        detector.probe_round().await;
        let echoes = sb
            .messages()
            .into_iter()
            .filter(|m| matches!(m.message, SouthboundMessage::EchoRequest { .. }))
            .count();
        assert_eq!(echoes, 2);
        // Delay metric drops cached paths after each round
        assert!(topo.paths().is_empty());
    }
}
