//! Uniform balance strategy

use super::{PolicyContext, PolicyStrategy};
use crate::error::PolicyResult;
use crate::types::PolicyMatrix;

/// Splits every ingress evenly over the instance pool
#[derive(Debug, Default)]
pub struct UniformStrategy;

impl UniformStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyStrategy for UniformStrategy {
    fn compute(&self, ctx: &PolicyContext<'_>) -> PolicyResult<Option<PolicyMatrix>> {
        let (rows, cols) = ctx.shape();
        Ok(Some(PolicyMatrix::uniform(rows, cols)))
    }

    fn name(&self) -> &'static str {
        "Uniform"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::Fixture;

    #[test]
    fn test_uniform_rows() {
        let fixture = Fixture::new(6, 4);
        let m = UniformStrategy::new().compute(&fixture.ctx()).unwrap().unwrap();
        assert_eq!((m.n_rows(), m.n_cols()), (6, 4));
        assert!(m.rows().iter().all(|row| row.iter().all(|w| *w == 0.25)));
    }
}
