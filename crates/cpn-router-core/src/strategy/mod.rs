//! Policy strategies
//!
//! - `UniformStrategy`: every row is `1/n`
//! - `QpsWeightedStrategy`: capacity-proportional, same for every ingress
//! - `OptimalTransportStrategy`: Sinkhorn between arrivals and capacities
//! - `DynamicFeedbackStrategy`: all traffic to the least-utilized instance
//! - `ShortestLinkStrategy`: per ingress, all traffic to the lowest-delay instance

mod dynamic_feedback;
mod optimal_transport;
mod qps_weighted;
mod shortest_link;
mod uniform;

pub use dynamic_feedback::DynamicFeedbackStrategy;
pub use optimal_transport::OptimalTransportStrategy;
pub use qps_weighted::QpsWeightedStrategy;
pub use shortest_link::ShortestLinkStrategy;
pub use uniform::UniformStrategy;

use cpn_core::{PolicyAlgorithm, PolicyConfig};
use std::sync::Arc;

use crate::error::PolicyResult;
use crate::network::NetworkView;
use crate::signals::{SignalSource, UtilizationSnapshot};
use crate::types::PolicyMatrix;

/// Everything a strategy may look at
pub struct PolicyContext<'a> {
    /// Row names, in matrix order
    pub ingress: &'a [String],
    /// Column names, in matrix order
    pub instances: &'a [String],
    pub signals: &'a dyn SignalSource,
    pub network: &'a dyn NetworkView,
    pub utilization: Option<Arc<UtilizationSnapshot>>,
}

impl PolicyContext<'_> {
    pub fn shape(&self) -> (usize, usize) {
        (self.ingress.len(), self.instances.len())
    }
}

/// Trait for forwarding policy strategies
pub trait PolicyStrategy: Send + Sync {
    /// Compute a new matrix; `Ok(None)` keeps the previous one
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Strategy selected by configuration
pub fn build_strategy(config: &PolicyConfig) -> Box<dyn PolicyStrategy> {
    match config.algorithm {
        PolicyAlgorithm::Balance => Box::new(UniformStrategy::new()),
        PolicyAlgorithm::QpsWeighted => Box::new(QpsWeightedStrategy::new()),
        PolicyAlgorithm::OptimalTransport => Box::new(OptimalTransportStrategy::from_config(config)),
        PolicyAlgorithm::DynamicFeedback => Box::new(DynamicFeedbackStrategy::new(config.noise_seed)),
        PolicyAlgorithm::ShortestLink => Box::new(ShortestLinkStrategy::new()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::network::StaticNetworkView;
    use crate::signals::StaticSignals;

    pub fn names(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    pub struct Fixture {
        pub ingress: Vec<String>,
        pub instances: Vec<String>,
        pub signals: StaticSignals,
        pub network: StaticNetworkView,
        pub utilization: Option<Arc<UtilizationSnapshot>>,
    }

    impl Fixture {
        pub fn new(n_ingress: usize, n_instances: usize) -> Self {
            Self {
                ingress: names("cpNode", n_ingress),
                instances: names("primeApp", n_instances),
                signals: StaticSignals::new(),
                network: StaticNetworkView::default(),
                utilization: None,
            }
        }

        pub fn ctx(&self) -> PolicyContext<'_> {
            PolicyContext {
                ingress: &self.ingress,
                instances: &self.instances,
                signals: &self.signals,
                network: &self.network,
                utilization: self.utilization.clone(),
            }
        }
    }
}
