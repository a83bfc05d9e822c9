//! Live network view for the policy engine
//!
//! Row `i` is an ingress switch, column `j` an instance host. Bandwidth is
//! the bottleneck of the widest hop-ranked candidate between them; delay
//! is the one-way delay of the lowest-delay path.

use cpn_network::graph::widest_path;
use cpn_network::TopologyStore;
use cpn_router_core::NetworkView;
use cpn_types::{Dpid, PathMetric};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub struct TopologyView {
    topology: Arc<TopologyStore>,
    ingress: Vec<Dpid>,
    instances: Vec<Ipv4Addr>,
}

impl TopologyView {
    pub fn new(topology: Arc<TopologyStore>, ingress: Vec<Dpid>, instances: Vec<Ipv4Addr>) -> Self {
        Self {
            topology,
            ingress,
            instances,
        }
    }

    /// Ingress switch and the switch the instance is attached to
    fn endpoints(&self, ingress: usize, instance: usize) -> Option<(Dpid, Dpid)> {
        let src = *self.ingress.get(ingress)?;
        let ip = *self.instances.get(instance)?;
        let (dst, _) = self.topology.resolve_host(ip)?;
        Some((src, dst))
    }
}

impl NetworkView for TopologyView {
    fn link_bandwidth(&self, ingress: usize, instance: usize) -> Option<f64> {
        let (src, dst) = self.endpoints(ingress, instance)?;
        let graph = self.topology.graph();
        let candidates = graph.k_shortest_paths(src, dst, PathMetric::Hop, self.topology.k_paths());
        widest_path(&graph, &candidates).map(|(bandwidth, _)| bandwidth)
    }

    fn link_delay(&self, ingress: usize, instance: usize) -> Option<f64> {
        let (src, dst) = self.endpoints(ingress, instance)?;
        let graph = self.topology.graph();
        let path = graph
            .k_shortest_paths(src, dst, PathMetric::Delay, 1)
            .into_iter()
            .next()?;
        let seconds = graph.path_weight(&path, PathMetric::Delay)?;
        seconds.is_finite().then(|| seconds * 1e3)
    }
}
