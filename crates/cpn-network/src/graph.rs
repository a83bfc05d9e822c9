//! Switch graph and path algorithms
//!
//! Directed graph keyed by dpid. Every switch carries a self-loop standing
//! for intra-switch forwarding. Edge attributes are filled in by the
//! topology store (hop) and the link-weight providers (bandwidth, delay).

use cpn_types::{Dpid, PathMetric};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

/// Bottleneck value of a path with no measured edge
pub const MAX_CAPACITY: f64 = 281_474_976_710_655.0;

/// Bandwidth of the intra-switch self-loop
pub const SWITCH_INTERIOR_BANDWIDTH: f64 = 1.0;

/// Delay of the intra-switch self-loop
pub const SWITCH_INTERIOR_DELAY: f64 = 0.0;

/// Edge attributes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    /// 1 for links, 0 for self-loops
    pub hop: f64,
    /// Free bandwidth in Mbit/s
    pub bandwidth: Option<f64>,
    /// One-way link delay in seconds
    pub delay: Option<f64>,
    /// Controller -> src -> dst -> controller probe round trip in seconds
    pub probe_delay: Option<f64>,
}

impl EdgeAttrs {
    fn link() -> Self {
        Self {
            hop: 1.0,
            bandwidth: None,
            delay: None,
            probe_delay: None,
        }
    }

    fn interior() -> Self {
        Self {
            hop: 0.0,
            bandwidth: Some(SWITCH_INTERIOR_BANDWIDTH),
            delay: Some(SWITCH_INTERIOR_DELAY),
            probe_delay: None,
        }
    }

    /// Weight used when ranking paths under `metric`.
    ///
    /// Bandwidth ranks candidates by hop; the widest one is picked
    /// afterwards. A missing delay counts as unusable.
    pub fn weight(&self, metric: PathMetric) -> f64 {
        match metric {
            PathMetric::Hop | PathMetric::Bandwidth => self.hop,
            PathMetric::Delay => self.delay.unwrap_or(f64::INFINITY),
        }
    }
}

/// Directed switch graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyGraph {
    nodes: BTreeSet<Dpid>,
    edges: BTreeMap<(Dpid, Dpid), EdgeAttrs>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch together with its self-loop
    pub fn add_node(&mut self, dpid: Dpid) {
        self.nodes.insert(dpid);
        self.edges.entry((dpid, dpid)).or_insert_with(EdgeAttrs::interior);
    }

    /// Remove a switch and every edge touching it
    pub fn remove_node(&mut self, dpid: Dpid) {
        self.nodes.remove(&dpid);
        self.edges.retain(|(src, dst), _| *src != dpid && *dst != dpid);
    }

    /// Add a link edge; attributes of an existing edge are kept
    pub fn add_edge(&mut self, src: Dpid, dst: Dpid) {
        self.add_node(src);
        self.add_node(dst);
        self.edges.entry((src, dst)).or_insert_with(EdgeAttrs::link);
    }

    pub fn remove_edge(&mut self, src: Dpid, dst: Dpid) {
        if src != dst {
            self.edges.remove(&(src, dst));
        }
    }

    pub fn contains_node(&self, dpid: Dpid) -> bool {
        self.nodes.contains(&dpid)
    }

    pub fn contains_edge(&self, src: Dpid, dst: Dpid) -> bool {
        self.edges.contains_key(&(src, dst))
    }

    pub fn edge(&self, src: Dpid, dst: Dpid) -> Option<&EdgeAttrs> {
        self.edges.get(&(src, dst))
    }

    pub fn edge_mut(&mut self, src: Dpid, dst: Dpid) -> Option<&mut EdgeAttrs> {
        self.edges.get_mut(&(src, dst))
    }

    pub fn nodes(&self) -> impl Iterator<Item = Dpid> + '_ {
        self.nodes.iter().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All edges including self-loops
    pub fn edges(&self) -> impl Iterator<Item = (Dpid, Dpid, &EdgeAttrs)> + '_ {
        self.edges.iter().map(|((s, d), a)| (*s, *d, a))
    }

    /// Outgoing link edges of `src`, self-loop excluded
    pub fn neighbors(&self, src: Dpid) -> impl Iterator<Item = (Dpid, &EdgeAttrs)> + '_ {
        self.edges
            .range((src, Dpid::MIN)..=(src, Dpid::MAX))
            .filter(move |((_, dst), _)| *dst != src)
            .map(|((_, dst), attrs)| (*dst, attrs))
    }

    /// Total weight of a path, `None` if a hop is not an edge
    pub fn path_weight(&self, path: &[Dpid], metric: PathMetric) -> Option<f64> {
        path.windows(2).try_fold(0.0, |acc, hop| {
            self.edge(hop[0], hop[1]).map(|attrs| acc + attrs.weight(metric))
        })
    }

    /// Up to `k` loop-free paths from `src` to `dst`, shortest first.
    ///
    /// Paths are ranked by total weight, then hop count; equal candidates
    /// keep discovery order. A switch to itself is the singleton path.
    pub fn k_shortest_paths(&self, src: Dpid, dst: Dpid, metric: PathMetric, k: usize) -> Vec<Vec<Dpid>> {
        if k == 0 || !self.contains_node(src) || !self.contains_node(dst) {
            return Vec::new();
        }
        if src == dst {
            return vec![vec![src]];
        }

        let no_edges = HashSet::new();
        let no_nodes = HashSet::new();
        let first = match self.dijkstra(src, dst, metric, &no_edges, &no_nodes) {
            Some((_, path)) => path,
            None => return Vec::new(),
        };

        let mut accepted: Vec<Vec<Dpid>> = vec![first];
        let mut candidates: Vec<(PathCost, usize, Vec<Dpid>)> = Vec::new();
        let mut seq = 0usize;

        while accepted.len() < k {
            let last = accepted[accepted.len() - 1].clone();
            for i in 0..last.len() - 1 {
                let spur = last[i];
                let root = &last[..=i];

                let banned_edges: HashSet<(Dpid, Dpid)> = accepted
                    .iter()
                    .filter(|p| p.len() > i + 1 && &p[..=i] == root)
                    .map(|p| (p[i], p[i + 1]))
                    .collect();
                let banned_nodes: HashSet<Dpid> = root[..i].iter().copied().collect();

                if let Some((_, spur_path)) = self.dijkstra(spur, dst, metric, &banned_edges, &banned_nodes) {
                    let mut total = root[..i].to_vec();
                    total.extend(spur_path);
                    let known = accepted.contains(&total) || candidates.iter().any(|(_, _, p)| *p == total);
                    if !known {
                        if let Some(weight) = self.path_weight(&total, metric) {
                            let cost = PathCost::new(weight, total.len() - 1);
                            candidates.push((cost, seq, total));
                            seq += 1;
                        }
                    }
                }
            }

            let best = candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
                .map(|(idx, _)| idx);
            match best {
                Some(idx) => accepted.push(candidates.swap_remove(idx).2),
                None => break,
            }
        }

        accepted
    }

    fn dijkstra(
        &self,
        src: Dpid,
        dst: Dpid,
        metric: PathMetric,
        banned_edges: &HashSet<(Dpid, Dpid)>,
        banned_nodes: &HashSet<Dpid>,
    ) -> Option<(PathCost, Vec<Dpid>)> {
        let mut dist: HashMap<Dpid, PathCost> = HashMap::new();
        let mut prev: HashMap<Dpid, Dpid> = HashMap::new();
        let mut heap = BinaryHeap::new();

        dist.insert(src, PathCost::new(0.0, 0));
        heap.push(Reverse((PathCost::new(0.0, 0), src)));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if node == dst {
                let mut path = vec![dst];
                let mut cur = dst;
                while let Some(&p) = prev.get(&cur) {
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some((cost, path));
            }
            if dist.get(&node).map_or(false, |best| cost > *best) {
                continue;
            }
            for (next, attrs) in self.neighbors(node) {
                if banned_nodes.contains(&next) || banned_edges.contains(&(node, next)) {
                    continue;
                }
                let candidate = PathCost::new(cost.weight + attrs.weight(metric), cost.hops + 1);
                let better = dist.get(&next).map_or(true, |best| candidate < *best);
                if better {
                    dist.insert(next, candidate);
                    prev.insert(next, node);
                    heap.push(Reverse((candidate, next)));
                }
            }
        }
        None
    }
}

/// (total weight, hop count) ordered lexicographically; infinite weights allowed
#[derive(Debug, Clone, Copy, PartialEq)]
struct PathCost {
    weight: f64,
    hops: usize,
}

impl PathCost {
    fn new(weight: f64, hops: usize) -> Self {
        Self { weight, hops }
    }
}

impl Eq for PathCost {}

impl PartialOrd for PathCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathCost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .total_cmp(&other.weight)
            .then(self.hops.cmp(&other.hops))
    }
}

/// Minimum measured edge bandwidth along `path`, starting from `start`.
///
/// Edges without a bandwidth reading are skipped; a path shorter than two
/// switches returns `start` unchanged.
pub fn bottleneck_bandwidth(graph: &TopologyGraph, path: &[Dpid], start: f64) -> f64 {
    path.windows(2)
        .filter_map(|hop| graph.edge(hop[0], hop[1]).and_then(|a| a.bandwidth))
        .fold(start, f64::min)
}

/// Widest candidate and its bottleneck bandwidth.
///
/// Ties keep the first candidate; if no candidate beats zero the first
/// one is returned with bandwidth 0.
pub fn widest_path<'a>(graph: &TopologyGraph, candidates: &'a [Vec<Dpid>]) -> Option<(f64, &'a Vec<Dpid>)> {
    let first = candidates.first()?;
    let mut best = (0.0, first);
    for path in candidates {
        let bw = bottleneck_bandwidth(graph, path, MAX_CAPACITY);
        if bw > best.0 {
            best = (bw, path);
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bidirectional(graph: &mut TopologyGraph, a: Dpid, b: Dpid) {
        graph.add_edge(a, b);
        graph.add_edge(b, a);
    }

    /// 1 - 2 - 4 and 1 - 3 - 4, plus a long way 1 - 5 - 6 - 4
    fn diamond() -> TopologyGraph {
        let mut g = TopologyGraph::new();
        bidirectional(&mut g, 1, 2);
        bidirectional(&mut g, 2, 4);
        bidirectional(&mut g, 1, 3);
        bidirectional(&mut g, 3, 4);
        bidirectional(&mut g, 1, 5);
        bidirectional(&mut g, 5, 6);
        bidirectional(&mut g, 6, 4);
        g
    }

    #[test]
    fn test_linear_hop_path() {
        let mut g = TopologyGraph::new();
        bidirectional(&mut g, 1, 2);
        bidirectional(&mut g, 2, 3);
        assert_eq!(g.k_shortest_paths(1, 3, PathMetric::Hop, 1), vec![vec![1, 2, 3]]);
        assert_eq!(g.k_shortest_paths(3, 1, PathMetric::Hop, 1), vec![vec![3, 2, 1]]);
    }

    #[test]
    fn test_self_path_is_singleton() {
        let mut g = TopologyGraph::new();
        g.add_node(7);
        assert_eq!(g.k_shortest_paths(7, 7, PathMetric::Hop, 3), vec![vec![7]]);
        assert_eq!(g.edge(7, 7).unwrap().hop, 0.0);
    }

    #[test]
    fn test_k_shortest_ordering() {
        let g = diamond();
        let paths = g.k_shortest_paths(1, 4, PathMetric::Hop, 5);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], vec![1, 2, 4]);
        assert_eq!(paths[1], vec![1, 3, 4]);
        assert_eq!(paths[2], vec![1, 5, 6, 4]);
        for p in &paths {
            assert_eq!(p.first(), Some(&1));
            assert_eq!(p.last(), Some(&4));
        }
    }

    #[test]
    fn test_delay_metric_prefers_fast_links() {
        let mut g = diamond();
        for (a, b, d) in [(1, 2, 0.5), (2, 4, 0.5), (1, 3, 0.01), (3, 4, 0.01)] {
            g.edge_mut(a, b).unwrap().delay = Some(d);
            g.edge_mut(b, a).unwrap().delay = Some(d);
        }
        let paths = g.k_shortest_paths(1, 4, PathMetric::Delay, 1);
        assert_eq!(paths, vec![vec![1, 3, 4]]);
    }

    #[test]
    fn test_unmeasured_delay_still_yields_path() {
        let g = diamond();
        let paths = g.k_shortest_paths(1, 4, PathMetric::Delay, 1);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3);
    }

    #[test]
    fn test_no_path() {
        let mut g = TopologyGraph::new();
        g.add_node(1);
        g.add_node(2);
        assert!(g.k_shortest_paths(1, 2, PathMetric::Hop, 1).is_empty());
        assert!(g.k_shortest_paths(1, 9, PathMetric::Hop, 1).is_empty());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut g = diamond();
        g.remove_node(2);
        assert!(!g.contains_edge(1, 2));
        assert!(!g.contains_edge(2, 4));
        assert_eq!(g.k_shortest_paths(1, 4, PathMetric::Hop, 1), vec![vec![1, 3, 4]]);
    }

    #[test]
    fn test_bottleneck_bandwidth() {
        let mut g = TopologyGraph::new();
        bidirectional(&mut g, 1, 2);
        bidirectional(&mut g, 2, 3);
        g.edge_mut(1, 2).unwrap().bandwidth = Some(10.0);
        g.edge_mut(2, 3).unwrap().bandwidth = Some(5.0);
        assert_eq!(bottleneck_bandwidth(&g, &[1, 2, 3], MAX_CAPACITY), 5.0);
        assert_eq!(bottleneck_bandwidth(&g, &[1], MAX_CAPACITY), MAX_CAPACITY);
    }

    #[test]
    fn test_bottleneck_skips_unmeasured_edges() {
        let mut g = TopologyGraph::new();
        bidirectional(&mut g, 1, 2);
        bidirectional(&mut g, 2, 3);
        g.edge_mut(1, 2).unwrap().bandwidth = Some(10.0);
        assert_eq!(bottleneck_bandwidth(&g, &[1, 2, 3], MAX_CAPACITY), 10.0);
    }

    #[test]
    fn test_widest_path_selection() {
        let mut g = diamond();
        g.edge_mut(1, 2).unwrap().bandwidth = Some(3.0);
        g.edge_mut(2, 4).unwrap().bandwidth = Some(100.0);
        g.edge_mut(1, 3).unwrap().bandwidth = Some(8.0);
        g.edge_mut(3, 4).unwrap().bandwidth = Some(9.0);
        let candidates = vec![vec![1, 2, 4], vec![1, 3, 4]];
        let (bw, path) = widest_path(&g, &candidates).unwrap();
        assert_eq!(bw, 8.0);
        assert_eq!(path, &vec![1, 3, 4]);
    }

    #[test]
    fn test_widest_path_tie_keeps_first() {
        let mut g = diamond();
        for (a, b) in [(1, 2), (2, 4), (1, 3), (3, 4)] {
            g.edge_mut(a, b).unwrap().bandwidth = Some(10.0);
        }
        let candidates = vec![vec![1, 2, 4], vec![1, 3, 4]];
        let (_, path) = widest_path(&g, &candidates).unwrap();
        assert_eq!(path, &vec![1, 2, 4]);
    }
}
