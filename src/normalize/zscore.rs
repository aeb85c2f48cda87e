//! Per-feature z-scoring and its inverse.

use crate::data::ensure_finite;
use crate::error::{BatchError, Result};
use crate::stats::{mean, sample_variance, unit_if_degenerate};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A z-scored matrix together with the parameters needed to invert it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Standardized {
    /// Standardized values (features × samples).
    #[serde(skip)]
    pub data: DMatrix<f64>,
    /// Per-feature mean across all samples.
    pub means: Vec<f64>,
    /// Per-feature sample standard deviation; zero replaced by 1.0.
    pub stds: Vec<f64>,
}

impl Standardized {
    /// Map values back to the original scale: `z * sd + mean` per feature.
    pub fn destandardize(&self, z: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if z.nrows() != self.means.len() {
            return Err(BatchError::DimensionMismatch {
                expected: self.means.len(),
                actual: z.nrows(),
            });
        }
        Ok(DMatrix::from_fn(z.nrows(), z.ncols(), |i, j| {
            z[(i, j)] * self.stds[i] + self.means[i]
        }))
    }

    /// Number of features.
    pub fn n_features(&self) -> usize {
        self.means.len()
    }
}

/// Z-score each feature (row) across samples.
///
/// Uses the sample standard deviation (n - 1). A feature with zero (or
/// undefined) spread gets unit standard deviation so constant rows map to 0
/// rather than NaN. Non-finite input is rejected.
pub fn standardize_features(x: &DMatrix<f64>) -> Result<Standardized> {
    ensure_finite(x)?;
    let n_features = x.nrows();

    let moments: Vec<(f64, f64, bool)> = (0..n_features)
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = x.row(i).iter().copied().collect();
            let var = sample_variance(&row);
            let degenerate = !(var.is_finite() && var > 0.0);
            (mean(&row), unit_if_degenerate(var).sqrt(), degenerate)
        })
        .collect();

    let n_degenerate = moments.iter().filter(|m| m.2).count();
    if n_degenerate > 0 {
        log::debug!("{} constant feature(s) standardized with unit sd", n_degenerate);
    }
    let (means, stds): (Vec<f64>, Vec<f64>) = moments.into_iter().map(|(m, s, _)| (m, s)).unzip();

    let data = DMatrix::from_fn(n_features, x.ncols(), |i, j| (x[(i, j)] - means[i]) / stds[i]);
    Ok(Standardized { data, means, stds })
}

/// Recombine the preserved design component with corrected residuals and
/// return to the original scale.
pub fn reconstruct(
    fitted: &DMatrix<f64>,
    corrected: &DMatrix<f64>,
    standardized: &Standardized,
) -> Result<DMatrix<f64>> {
    if fitted.shape() != corrected.shape() {
        return Err(BatchError::DimensionMismatch {
            expected: fitted.nrows() * fitted.ncols(),
            actual: corrected.nrows() * corrected.ncols(),
        });
    }
    standardized.destandardize(&(fitted + corrected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_data() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 4, &[
            1.0, 2.0, 3.0, 4.0,
            10.0, 10.0, 10.0, 10.0, // constant feature
            -2.0, 0.5, 7.0, 3.5,
        ])
    }

    #[test]
    fn test_zscore_moments() {
        let s = standardize_features(&create_test_data()).unwrap();
        assert_relative_eq!(s.means[0], 2.5);
        assert_relative_eq!(s.stds[0], (5.0_f64 / 3.0).sqrt(), epsilon = 1e-12);

        for i in [0, 2] {
            let row: Vec<f64> = s.data.row(i).iter().copied().collect();
            assert_relative_eq!(mean(&row), 0.0, epsilon = 1e-12);
            assert_relative_eq!(sample_variance(&row), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_constant_feature_guard() {
        let s = standardize_features(&create_test_data()).unwrap();
        assert_eq!(s.stds[1], 1.0);
        assert!(s.data.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_identity_round_trip() {
        let x = create_test_data();
        let s = standardize_features(&x).unwrap();
        let back = s.destandardize(&s.data).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut x = create_test_data();
        x[(2, 1)] = f64::NAN;
        assert!(matches!(
            standardize_features(&x),
            Err(BatchError::NonFinite { feature: 2, sample: 1 })
        ));
    }

    #[test]
    fn test_reconstruct_adds_fitted() {
        let x = create_test_data();
        let s = standardize_features(&x).unwrap();
        let fitted = DMatrix::from_element(3, 4, 0.5);
        let corrected = &s.data - &fitted;
        let back = reconstruct(&fitted, &corrected, &s).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10);
        }

        let wrong = DMatrix::zeros(2, 4);
        assert!(reconstruct(&fitted, &wrong, &s).is_err());
    }
}
