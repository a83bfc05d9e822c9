//! Entropy-regularized optimal transport (Sinkhorn-Knopp)
//!
//! ```text
//! K = exp(-M / reg)
//! repeat:
//!     u = r / (K v)
//!     v = c / (Kᵀ u)
//! until mean |u - u_prev| < tol or max_iters
//! T = diag(u) K diag(v)
//! ```
//!
//! Runs sequentially so identical inputs give identical plans.

use crate::error::{PolicyError, PolicyResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornSolution {
    /// Transport plan, rows follow `r`, columns follow `c`
    pub plan: Vec<Vec<f64>>,
    pub iterations: usize,
    pub converged: bool,
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den > 0.0 && den.is_finite() {
        num / den
    } else {
        0.0
    }
}

/// Solve the regularized transport problem between marginals `r` and `c`
pub fn sinkhorn(
    r: &[f64],
    c: &[f64],
    cost: &[Vec<f64>],
    reg: f64,
    tolerance: f64,
    max_iters: usize,
) -> PolicyResult<SinkhornSolution> {
    let (d1, d2) = (r.len(), c.len());
    if d1 == 0 || d2 == 0 {
        return Err(PolicyError::EmptyPool(format!("marginals {}x{}", d1, d2)));
    }
    if cost.len() != d1 || cost.iter().any(|row| row.len() != d2) {
        return Err(PolicyError::ShapeMismatch {
            expected: format!("{}x{}", d1, d2),
            actual: format!("{}x{}", cost.len(), cost.first().map_or(0, Vec::len)),
        });
    }
    if !(reg > 0.0) {
        return Err(PolicyError::InvalidSignal(format!("regularization {}", reg)));
    }

    let kernel: Vec<Vec<f64>> = cost
        .iter()
        .map(|row| row.iter().map(|m| (-m / reg).exp()).collect())
        .collect();
    let mut u = vec![1.0 / d1 as f64; d1];
    let mut v = vec![1.0 / d2 as f64; d2];

    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iters {
        iterations += 1;
        let previous = u.clone();

        for i in 0..d1 {
            let kv: f64 = (0..d2).map(|j| kernel[i][j] * v[j]).sum();
            u[i] = safe_div(r[i], kv);
        }
        for j in 0..d2 {
            let ktu: f64 = (0..d1).map(|i| kernel[i][j] * u[i]).sum();
            v[j] = safe_div(c[j], ktu);
        }

        let err = u
            .iter()
            .zip(&previous)
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / d1 as f64;
        if err < tolerance {
            converged = true;
            break;
        }
    }

    let plan = (0..d1)
        .map(|i| (0..d2).map(|j| u[i] * kernel[i][j] * v[j]).collect())
        .collect();
    Ok(SinkhornSolution {
        plan,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_sums(plan: &[Vec<f64>]) -> Vec<f64> {
        plan.iter().map(|row| row.iter().sum()).collect()
    }

    #[test]
    fn test_uniform_marginals_constant_cost() {
        let cost = vec![vec![0.5, 0.5], vec![0.5, 0.5]];
        let solution = sinkhorn(&[0.5, 0.5], &[0.5, 0.5], &cost, 1e-2, 1e-8, 100).unwrap();
        assert!(solution.converged);
        for row in &solution.plan {
            for value in row {
                assert!((value - 0.25).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_cheap_diagonal_preferred() {
        let cost = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let solution = sinkhorn(&[0.5, 0.5], &[0.5, 0.5], &cost, 1e-1, 1e-10, 500).unwrap();
        assert!(solution.plan[0][0] > solution.plan[0][1]);
        assert!(solution.plan[1][1] > solution.plan[1][0]);
        for sum in row_sums(&solution.plan) {
            assert!((sum - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_column_marginals_hold() {
        let cost = vec![vec![0.2, 0.9, 0.4], vec![0.7, 0.1, 0.3]];
        let c = [0.2, 0.3, 0.5];
        let solution = sinkhorn(&[0.6, 0.4], &c, &cost, 1e-1, 1e-12, 1000).unwrap();
        for (j, target) in c.iter().enumerate() {
            let col: f64 = solution.plan.iter().map(|row| row[j]).sum();
            assert!((col - target).abs() < 1e-9);
        }
    }

    #[test]
    fn test_deterministic() {
        let cost = vec![vec![0.3, 0.6], vec![0.9, 0.1]];
        let a = sinkhorn(&[0.3, 0.7], &[0.4, 0.6], &cost, 1e-2, 1e-8, 100).unwrap();
        let b = sinkhorn(&[0.3, 0.7], &[0.4, 0.6], &cost, 1e-2, 1e-8, 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_shape_mismatch() {
        let cost = vec![vec![0.0, 1.0]];
        assert!(matches!(
            sinkhorn(&[0.5, 0.5], &[0.5, 0.5], &cost, 1e-2, 1e-8, 10),
            Err(PolicyError::ShapeMismatch { .. })
        ));
        assert!(sinkhorn(&[], &[1.0], &[], 1e-2, 1e-8, 10).is_err());
    }
}
