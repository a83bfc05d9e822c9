//! Dynamic feedback strategy
//!
//! Greedy: every ingress sends everything to the instance with the lowest
//! CPU utilization after adding uniform noise in [0, 1).

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::{PolicyContext, PolicyStrategy};
use crate::error::PolicyResult;
use crate::types::{argmin, PolicyMatrix};

pub struct DynamicFeedbackStrategy {
    rng: Mutex<ChaCha8Rng>,
}

impl DynamicFeedbackStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl PolicyStrategy for DynamicFeedbackStrategy {
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
        let Some(snapshot) = ctx.utilization.as_ref() else {
            debug!("No utilization snapshot yet");
            return Ok(None);
        };
        let Some(utilization) = ctx
            .instances
            .iter()
            .map(|name| snapshot.get(name))
            .collect::<Option<Vec<f64>>>()
        else {
            debug!(reported = snapshot.len(), instances = ctx.instances.len(), "Utilization snapshot incomplete");
            return Ok(None);
        };

        let perturbed: Vec<f64> = {
            let mut rng = self.rng.lock();
            utilization.iter().map(|u| u + rng.gen::<f64>()).collect()
        };
        let Some(target) = argmin(&perturbed) else {
            return Ok(None);
        };
        debug!(instance = %ctx.instances[target], cpu = utilization[target], "Least utilized instance");
        PolicyMatrix::one_hot(ctx.instances.len(), &vec![target; ctx.ingress.len()]).map(Some)
    }

    fn name(&self) -> &'static str {
        "DynamicFeedback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::parse_container_stats;
    use crate::strategy::test_support::Fixture;
    use std::sync::Arc;

    #[test]
    fn test_all_rows_to_least_utilized() {
        let mut fixture = Fixture::new(4, 3);
        fixture.utilization = Some(Arc::new(parse_container_stats(
            "mn.primeApp1: 80%\nmn.primeApp2: 5%\nmn.primeApp3: 60%",
            "mn.",
        )));
        let strategy = DynamicFeedbackStrategy::new(68);
        let m = strategy.compute(&fixture.ctx()).unwrap().unwrap();
        assert!(m.rows().iter().all(|row| row == &vec![0.0, 1.0, 0.0]));
    }

    #[test]
    fn test_missing_snapshot_keeps_previous() {
        let mut fixture = Fixture::new(2, 2);
        let strategy = DynamicFeedbackStrategy::new(68);
        assert!(strategy.compute(&fixture.ctx()).unwrap().is_none());

        fixture.utilization = Some(Arc::new(parse_container_stats("mn.primeApp1: 1%", "mn.")));
        assert!(strategy.compute(&fixture.ctx()).unwrap().is_none());
    }
}
