//! Shortest-link strategy

use super::{PolicyContext, PolicyStrategy};
use crate::error::PolicyResult;
use crate::types::{argmin, PolicyMatrix};

/// Sends each ingress to its lowest-delay instance, ignoring load
#[derive(Debug, Default)]
pub struct ShortestLinkStrategy;

impl ShortestLinkStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyStrategy for ShortestLinkStrategy {
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
        let (rows, cols) = ctx.shape();
        let choices: Vec<usize> = (0..rows)
            .map(|i| {
                let delays: Vec<f64> = (0..cols)
                    .map(|j| ctx.network.link_delay(i, j).unwrap_or(f64::INFINITY))
                    .collect();
                argmin(&delays).unwrap_or(0)
            })
            .collect();
        PolicyMatrix::one_hot(cols, &choices).map(Some)
    }

    fn name(&self) -> &'static str {
        "ShortestLink"
    }
}
