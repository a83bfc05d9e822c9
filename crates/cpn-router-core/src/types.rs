//! Forwarding policy matrix

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/// Row tolerance used when checking a published matrix
pub const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// Ingress × instance forwarding probabilities.
///
/// Every row is non-negative and sums to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMatrix {
    rows: Vec<Vec<f64>>,
}

impl PolicyMatrix {
    /// Every row is `1/n_cols`
    pub fn uniform(n_rows: usize, n_cols: usize) -> Self {
        let share = if n_cols == 0 { 0.0 } else { 1.0 / n_cols as f64 };
        Self {
            rows: vec![vec![share; n_cols]; n_rows],
        }
    }

    /// Each row sends everything to one column
    pub fn one_hot(n_cols: usize, choices: &[usize]) -> PolicyResult<Self> {
        let rows = choices
            .iter()
            .map(|&choice| {
                if choice >= n_cols {
                    return Err(PolicyError::ShapeMismatch {
                        expected: format!("column < {}", n_cols),
                        actual: choice.to_string(),
                    });
                }
                let mut row = vec![0.0; n_cols];
                row[choice] = 1.0;
                Ok(row)
            })
            .collect::<PolicyResult<Vec<_>>>()?;
        Ok(Self { rows })
    }

    /// Row-normalize arbitrary non-negative weights.
    ///
    /// A row summing to zero becomes uniform.
    pub fn from_weights(weights: Vec<Vec<f64>>) -> PolicyResult<Self> {
        let n_cols = weights.first().map_or(0, Vec::len);
        let mut rows = Vec::with_capacity(weights.len());
        for (i, row) in weights.into_iter().enumerate() {
            if row.len() != n_cols {
                return Err(PolicyError::ShapeMismatch {
                    expected: format!("{} columns", n_cols),
                    actual: format!("row {} has {}", i, row.len()),
                });
            }
            if row.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(PolicyError::InvalidMatrix(format!("row {}: {:?}", i, row)));
            }
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                rows.push(row.into_iter().map(|w| w / sum).collect());
            } else {
                rows.push(vec![1.0 / n_cols.max(1) as f64; n_cols]);
            }
        }
        Ok(Self { rows })
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// All entries non-negative, every row summing to 1 within `tolerance`
    pub fn is_row_stochastic(&self, tolerance: f64) -> bool {
        self.rows.iter().all(|row| {
            let sum: f64 = row.iter().sum();
            row.iter().all(|w| w.is_finite() && *w >= 0.0) && (sum - 1.0).abs() <= tolerance
        })
    }
}

/// Index of the first smallest value
pub(crate) fn argmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if v.total_cmp(&b).is_ge() => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform() {
        let m = PolicyMatrix::uniform(3, 4);
        assert_eq!(m.n_rows(), 3);
        assert_eq!(m.n_cols(), 4);
        assert_eq!(m.row(2), Some(&[0.25, 0.25, 0.25, 0.25][..]));
        assert!(m.is_row_stochastic(ROW_SUM_TOLERANCE));
    }

    #[test]
    fn test_from_weights_normalizes() {
        let m = PolicyMatrix::from_weights(vec![vec![1.0, 3.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(m.row(0), Some(&[0.25, 0.75][..]));
        assert_eq!(m.row(1), Some(&[0.5, 0.5][..]));

        assert!(PolicyMatrix::from_weights(vec![vec![1.0, -1.0]]).is_err());
        assert!(PolicyMatrix::from_weights(vec![vec![1.0, 1.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_one_hot() {
        let m = PolicyMatrix::one_hot(3, &[2, 0]).unwrap();
        assert_eq!(m.row(0), Some(&[0.0, 0.0, 1.0][..]));
        assert_eq!(m.row(1), Some(&[1.0, 0.0, 0.0][..]));
        assert!(PolicyMatrix::one_hot(2, &[2]).is_err());
    }

    #[test]
    fn test_argmin_keeps_first() {
        assert_eq!(argmin(&[3.0, 1.0, 1.0]), Some(1));
        assert_eq!(argmin(&[f64::INFINITY, f64::INFINITY]), Some(0));
        assert_eq!(argmin(&[]), None);
    }
}
