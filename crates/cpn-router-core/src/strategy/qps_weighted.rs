//! Capacity-weighted strategy
//!
//! Each instance's share is its calibrated sustainable request rate over
//! the pool total; every ingress row is identical.

use tracing::debug;

use super::{PolicyContext, PolicyStrategy};
use crate::error::{PolicyError, PolicyResult};
use crate::signals::ordered_values;
use crate::types::PolicyMatrix;

#[derive(Debug, Default)]
pub struct QpsWeightedStrategy;

impl QpsWeightedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyStrategy for QpsWeightedStrategy {
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
        let Some(table) = ctx.signals.capacities()? else {
            debug!("Capacity table missing");
            return Ok(None);
        };
        let Some(capacity) = ordered_values(&table, ctx.instances) else {
            debug!(entries = table.len(), instances = ctx.instances.len(), "Capacity table is stale");
            return Ok(None);
        };
        let total: f64 = capacity.iter().sum();
        if !(total > 0.0) || capacity.iter().any(|c| *c < 0.0) {
            return Err(PolicyError::InvalidSignal(format!("capacities {:?}", capacity)));
        }
        let row: Vec<f64> = capacity.iter().map(|c| c / total).collect();
        PolicyMatrix::from_weights(vec![row; ctx.ingress.len()]).map(Some)
    }

    fn name(&self) -> &'static str {
        "QpsWeighted"
    }
}
