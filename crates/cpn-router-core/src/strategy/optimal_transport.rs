//! Optimal-transport strategy
//!
//! Moves the arrival distribution (rows) onto the capacity distribution
//! (columns) at least network cost:
//!
//! ```text
//! cost[i][j] = (payload_in + payload_out) / bandwidth[i][j] + delay[i][j]
//! ```
//!
//! When capacity exceeds demand a zero-cost virtual ingress absorbs the
//! slack and its row is dropped afterwards. When demand exceeds capacity the
//! capacities are scaled up to match.

use parking_lot::Mutex;
use tracing::{debug, info};

use cpn_core::PolicyConfig;

use super::{PolicyContext, PolicyStrategy};
use crate::error::{PolicyError, PolicyResult};
use crate::signals::ordered_values;
use crate::sinkhorn::sinkhorn;
use crate::types::PolicyMatrix;

pub struct OptimalTransportStrategy {
    payload_bytes: f64,
    reg: f64,
    tolerance: f64,
    max_iters: usize,
    /// Fingerprint of the last arrival/capacity vectors used
    last_inputs: Mutex<Option<blake3::Hash>>,
}

impl OptimalTransportStrategy {
    pub fn new(payload_bytes: f64, reg: f64, tolerance: f64, max_iters: usize) -> Self {
        Self {
            payload_bytes,
            reg,
            tolerance,
            max_iters,
            last_inputs: Mutex::new(None),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            config.payload_in_bytes + config.payload_out_bytes,
            config.sinkhorn_reg,
            config.sinkhorn_tolerance,
            config.sinkhorn_max_iters,
        )
    }

    fn fingerprint(arrival: &[f64], capacity: &[f64]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for values in [arrival, capacity] {
            hasher.update(&(values.len() as u64).to_le_bytes());
            for v in values {
                hasher.update(&v.to_bits().to_le_bytes());
            }
        }
        hasher.finalize()
    }

    /// Cost matrix scaled to [0, 1]; unmeasured links cost the maximum
    fn cost_matrix(&self, ctx: &PolicyContext<'_>) -> Vec<Vec<f64>> {
        let (rows, cols) = ctx.shape();
        let raw: Vec<Vec<f64>> = (0..rows)
            .map(|i| {
                (0..cols)
                    .map(|j| {
                        let bandwidth = ctx.network.link_bandwidth(i, j).filter(|bw| *bw > 0.0);
                        match (bandwidth, ctx.network.link_delay(i, j)) {
                            (Some(bw), Some(delay)) => self.payload_bytes / bw + delay,
                            _ => f64::INFINITY,
                        }
                    })
                    .collect()
            })
            .collect();

        let max = raw
            .iter()
            .flatten()
            .copied()
            .filter(|c| c.is_finite())
            .fold(0.0_f64, f64::max);
        raw.into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|c| match (c.is_finite(), max > 0.0) {
                        (false, _) => 1.0,
                        (true, true) => c / max,
                        (true, false) => 0.0,
                    })
                    .collect()
            })
            .collect()
    }

    fn solve(&self, ctx: &PolicyContext<'_>, arrival: &[f64], capacity: &[f64]) -> PolicyResult<PolicyMatrix> {
        let arrival_total: f64 = arrival.iter().sum();
        let capacity_total: f64 = capacity.iter().sum();
        if !(arrival_total > 0.0) || !(capacity_total > 0.0) {
            return Err(PolicyError::InvalidSignal(format!(
                "arrival total {}, capacity total {}",
                arrival_total, capacity_total
            )));
        }

        let mut cost = self.cost_matrix(ctx);
        let mut rows = arrival.to_vec();
        let virtual_row = arrival_total < capacity_total;
        if virtual_row {
            rows.push(capacity_total - arrival_total);
            cost.push(vec![0.0; capacity.len()]);
        }

        let scale = if virtual_row { 1.0 } else { arrival_total / capacity_total };
        let columns: Vec<f64> = capacity.iter().map(|c| c * scale).collect();
        let column_total: f64 = columns.iter().sum();
        let row_total: f64 = rows.iter().sum();
        let r: Vec<f64> = rows.iter().map(|v| v / row_total).collect();
        let c: Vec<f64> = columns.iter().map(|v| v / column_total).collect();

        let solution = sinkhorn(&r, &c, &cost, self.reg, self.tolerance, self.max_iters)?;
        debug!(
            iterations = solution.iterations,
            converged = solution.converged,
            virtual_row = virtual_row,
            "Sinkhorn finished"
        );

        let mut plan = solution.plan;
        if virtual_row {
            plan.pop();
        }
        PolicyMatrix::from_weights(plan)
    }
}

impl PolicyStrategy for OptimalTransportStrategy {
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
        let (Some(capacities), Some(arrivals)) = (ctx.signals.capacities()?, ctx.signals.arrivals()?) else {
            debug!("Signal tables missing");
            return Ok(None);
        };
        let (Some(capacity), Some(arrival)) = (
            ordered_values(&capacities, ctx.instances),
            ordered_values(&arrivals, ctx.ingress),
        ) else {
            debug!(
                capacities = capacities.len(),
                arrivals = arrivals.len(),
                "Signal tables do not match the topology"
            );
            return Ok(None);
        };

        let fingerprint = Self::fingerprint(&arrival, &capacity);
        if *self.last_inputs.lock() == Some(fingerprint) {
            debug!("Signals unchanged, keeping policy");
            return Ok(None);
        }

        let matrix = self.solve(ctx, &arrival, &capacity)?;
        *self.last_inputs.lock() = Some(fingerprint);
        info!(rows = matrix.n_rows(), cols = matrix.n_cols(), "Optimal-transport policy computed");
        Ok(Some(matrix))
    }

    fn name(&self) -> &'static str {
        "OptimalTransport"
    }
}
