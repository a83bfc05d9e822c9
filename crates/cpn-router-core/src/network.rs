//! Ingress-to-instance network quality

/// Link quality between an ingress switch and a service instance.
///
/// Indices follow the policy matrix: rows are ingress nodes, columns are
/// instances.
pub trait NetworkView: Send + Sync {
    /// Available bandwidth in Mbit/s
    fn link_bandwidth(&self, ingress: usize, instance: usize) -> Option<f64>;

    /// One-way delay in milliseconds
    fn link_delay(&self, ingress: usize, instance: usize) -> Option<f64>;
}

/// Fixed bandwidth and delay tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticNetworkView {
    pub bandwidth: Vec<Vec<f64>>,
    pub delay: Vec<Vec<f64>>,
}

impl StaticNetworkView {
    pub fn new(bandwidth: Vec<Vec<f64>>, delay: Vec<Vec<f64>>) -> Self {
        Self { bandwidth, delay }
    }
}

impl NetworkView for StaticNetworkView {
    fn link_bandwidth(&self, ingress: usize, instance: usize) -> Option<f64> {
        self.bandwidth.get(ingress)?.get(instance).copied()
    }

    fn link_delay(&self, ingress: usize, instance: usize) -> Option<f64> {
        self.delay.get(ingress)?.get(instance).copied()
    }
}
