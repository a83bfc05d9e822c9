//! Policy engine
//!
//! Owns the forwarding policy matrix of one service. The matrix is
//! replaced as a whole (`Arc` swap), so readers always see a complete one.
//! A failed or stale computation keeps the previous matrix.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::network::NetworkView;
use crate::signals::{SignalSource, UtilizationFeed};
use crate::strategy::{PolicyContext, PolicyStrategy};
use crate::types::{PolicyMatrix, ROW_SUM_TOLERANCE};

pub struct PolicyEngine {
    strategy: Box<dyn PolicyStrategy>,
    ingress: Vec<String>,
    instances: Vec<String>,
    signals: Arc<dyn SignalSource>,
    network: Arc<dyn NetworkView>,
    utilization: Arc<UtilizationFeed>,
    current: RwLock<Arc<PolicyMatrix>>,
    update_period: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl PolicyEngine {
    /// Starts from the uniform matrix
    pub fn new(
        strategy: Box<dyn PolicyStrategy>,
        ingress: Vec<String>,
        instances: Vec<String>,
        signals: Arc<dyn SignalSource>,
        network: Arc<dyn NetworkView>,
        utilization: Arc<UtilizationFeed>,
        update_period: Duration,
    ) -> PolicyResult<Self> {
        if ingress.is_empty() || instances.is_empty() {
            return Err(PolicyError::EmptyPool(format!(
                "{} ingress nodes, {} instances",
                ingress.len(),
                instances.len()
            )));
        }
        info!(
            strategy = strategy.name(),
            ingress = ingress.len(),
            instances = instances.len(),
            "Policy engine created"
        );
        let initial = PolicyMatrix::uniform(ingress.len(), instances.len());
        Ok(Self {
            strategy,
            ingress,
            instances,
            signals,
            network,
            utilization,
            current: RwLock::new(Arc::new(initial)),
            update_period,
            last_update: Mutex::new(None),
        })
    }

    /// Latest published matrix
    pub fn current(&self) -> Arc<PolicyMatrix> {
        self.current.read().clone()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn ingress(&self) -> &[String] {
        &self.ingress
    }

    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    /// Run the strategy and publish its matrix if it is usable
    pub fn compute_policy(&self) -> Arc<PolicyMatrix> {
        *self.last_update.lock() = Some(Instant::now());
        let ctx = PolicyContext {
            ingress: &self.ingress,
            instances: &self.instances,
            signals: self.signals.as_ref(),
            network: self.network.as_ref(),
            utilization: self.utilization.latest(),
        };

        match self.strategy.compute(&ctx) {
            Ok(Some(matrix)) => {
                if let Err(e) = self.check(&matrix) {
                    warn!(strategy = self.strategy.name(), error = %e, "Rejected policy matrix");
                } else if *self.current() != matrix {
                    debug!(strategy = self.strategy.name(), "Policy matrix updated");
                    *self.current.write() = Arc::new(matrix);
                }
            }
            Ok(None) => debug!(strategy = self.strategy.name(), "Keeping previous policy"),
            Err(e) => warn!(strategy = self.strategy.name(), error = %e, "Policy computation failed, keeping previous"),
        }
        self.current()
    }

    /// Recompute when the update period has elapsed; returns whether it ran
    pub fn refresh_if_due(&self) -> bool {
        let due = self
            .last_update
            .lock()
            .map_or(true, |at| at.elapsed() >= self.update_period);
        if due {
            self.compute_policy();
        }
        due
    }

    fn check(&self, matrix: &PolicyMatrix) -> PolicyResult<()> {
        let expected = (self.ingress.len(), self.instances.len());
        let actual = (matrix.n_rows(), matrix.n_cols());
        if expected != actual {
            return Err(PolicyError::ShapeMismatch {
                expected: format!("{}x{}", expected.0, expected.1),
                actual: format!("{}x{}", actual.0, actual.1),
            });
        }
        if !matrix.is_row_stochastic(ROW_SUM_TOLERANCE) {
            return Err(PolicyError::InvalidMatrix("rows do not sum to 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticNetworkView;
    use crate::signals::{parse_container_stats, StaticSignals};
    use crate::strategy::test_support::names;
    use crate::strategy::{
        DynamicFeedbackStrategy, OptimalTransportStrategy, QpsWeightedStrategy, ShortestLinkStrategy,
        UniformStrategy,
    };
    use cpn_core::PolicyConfig;

    struct Broken;

    impl PolicyStrategy for Broken {
        fn compute(&self, _ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
            Ok(Some(PolicyMatrix::uniform(1, 1)))
        }

        fn name(&self) -> &'static str {
            "Broken"
        }
    }

    fn engine(strategy: Box<dyn PolicyStrategy>, signals: Arc<StaticSignals>, feed: Arc<UtilizationFeed>) -> PolicyEngine {
        let network = StaticNetworkView::new(
            vec![vec![20.0, 30.0]; 3],
            vec![vec![100.0, 20.0], vec![50.0, 60.0], vec![10.0, 10.0]],
        );
        PolicyEngine::new(
            strategy,
            names("cpNode", 3),
            names("primeApp", 2),
            signals,
            Arc::new(network),
            feed,
            Duration::from_secs(4),
        )
        .unwrap()
    }

    fn table(entries: &[(&str, f64)]) -> crate::signals::SignalTable {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_every_strategy_yields_stochastic_rows() {
        let signals = Arc::new(StaticSignals::new());
        signals.set_capacities(table(&[("primeApp1", 40.0), ("primeApp2", 60.0)]));
        signals.set_arrivals(table(&[("cpNode1", 10.0), ("cpNode2", 20.0), ("cpNode3", 30.0)]));
        let feed = Arc::new(UtilizationFeed::new());
        feed.publish(parse_container_stats("mn.primeApp1: 40%\nmn.primeApp2: 70%", "mn."));

        let config = PolicyConfig::default();
        let strategies: Vec<Box<dyn PolicyStrategy>> = vec![
            Box::new(UniformStrategy::new()),
            Box::new(QpsWeightedStrategy::new()),
            Box::new(OptimalTransportStrategy::from_config(&config)),
            Box::new(DynamicFeedbackStrategy::new(config.noise_seed)),
            Box::new(ShortestLinkStrategy::new()),
        ];
        for strategy in strategies {
            let name = strategy.name();
            let engine = engine(strategy, signals.clone(), feed.clone());
            let m = engine.compute_policy();
            assert_eq!((m.n_rows(), m.n_cols()), (3, 2), "{}", name);
            assert!(m.is_row_stochastic(ROW_SUM_TOLERANCE), "{}", name);
        }
    }

    #[test]
    fn test_stale_signals_keep_previous_matrix() {
        let signals = Arc::new(StaticSignals::new());
        signals.set_capacities(table(&[("primeApp1", 25.0), ("primeApp2", 75.0)]));
        let engine = engine(Box::new(QpsWeightedStrategy::new()), signals.clone(), Arc::new(UtilizationFeed::new()));

        let first = engine.compute_policy();
        assert_eq!(first.row(0), Some(&[0.25, 0.75][..]));

        signals.set_capacities(table(&[("primeApp1", 25.0)]));
        let second = engine.compute_policy();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let engine = engine(Box::new(Broken), Arc::new(StaticSignals::new()), Arc::new(UtilizationFeed::new()));
        let m = engine.compute_policy();
        assert_eq!(*m, PolicyMatrix::uniform(3, 2));
    }

    #[test]
    fn test_refresh_cadence() {
        let engine = engine(
            Box::new(UniformStrategy::new()),
            Arc::new(StaticSignals::new()),
            Arc::new(UtilizationFeed::new()),
        );
        assert!(engine.refresh_if_due());
        assert!(!engine.refresh_if_due());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = PolicyEngine::new(
            Box::new(UniformStrategy::new()),
            names("cpNode", 2),
            vec![],
            Arc::new(StaticSignals::new()),
            Arc::new(StaticNetworkView::default()),
            Arc::new(UtilizationFeed::new()),
            Duration::from_secs(4),
        );
        assert!(matches!(result, Err(PolicyError::EmptyPool(_))));
    }
}
