//! Per-batch location/scale alignment of design residuals.

use crate::data::BatchLabels;
use crate::error::{BatchError, Result};
use crate::stats::{mean, sample_variance, unit_if_degenerate};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Raw per-batch, per-feature residual moments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMoments {
    /// Batch names, in level order (one per column below).
    pub levels: Vec<String>,
    /// Samples per batch.
    pub sizes: Vec<usize>,
    /// Per-feature batch means (features × batches).
    #[serde(skip)]
    pub means: DMatrix<f64>,
    /// Per-feature batch sample variances, zero replaced by 1.0 (features × batches).
    #[serde(skip)]
    pub variances: DMatrix<f64>,
}

impl BatchMoments {
    pub fn n_features(&self) -> usize {
        self.means.nrows()
    }

    pub fn n_batches(&self) -> usize {
        self.levels.len()
    }

    /// Means of one batch across features.
    pub fn batch_means(&self, level: usize) -> Vec<f64> {
        self.means.column(level).iter().copied().collect()
    }

    /// Variances of one batch across features.
    pub fn batch_variances(&self, level: usize) -> Vec<f64> {
        self.variances.column(level).iter().copied().collect()
    }
}

/// Estimate the mean and sample variance of every feature within every batch.
///
/// A zero or undefined variance (constant feature, single-sample batch) is
/// replaced by 1.0.
pub fn estimate_batch_moments(
    residuals: &DMatrix<f64>,
    batches: &BatchLabels,
) -> Result<BatchMoments> {
    if batches.n_samples() != residuals.ncols() {
        return Err(BatchError::DimensionMismatch {
            expected: residuals.ncols(),
            actual: batches.n_samples(),
        });
    }

    let n_features = residuals.nrows();
    let n_batches = batches.n_batches();

    // One (means, variances) column pair per batch
    let columns: Vec<(Vec<f64>, Vec<f64>)> = (0..n_batches)
        .into_par_iter()
        .map(|b| {
            let cols = batches.indices(b);
            let mut means = Vec::with_capacity(n_features);
            let mut vars = Vec::with_capacity(n_features);
            let mut values = vec![0.0; cols.len()];
            for i in 0..n_features {
                for (slot, &j) in values.iter_mut().zip(cols) {
                    *slot = residuals[(i, j)];
                }
                means.push(mean(&values));
                vars.push(unit_if_degenerate(sample_variance(&values)));
            }
            (means, vars)
        })
        .collect();

    let means = DMatrix::from_fn(n_features, n_batches, |i, b| columns[b].0[i]);
    let variances = DMatrix::from_fn(n_features, n_batches, |i, b| columns[b].1[i]);

    for (level, size) in batches.levels().iter().zip(batches.sizes()) {
        log::debug!("batch '{}': {} samples", level, size);
    }

    Ok(BatchMoments {
        levels: batches.levels().to_vec(),
        sizes: batches.sizes(),
        means,
        variances,
    })
}

/// Center and scale each batch's columns: `(r − mean) / sqrt(var)` per feature.
///
/// `means` and `variances` are features × batches, with columns in the level
/// order of `batches`. Each batch only touches its own columns, so the result
/// for one batch never depends on another.
pub fn align_batches(
    residuals: &DMatrix<f64>,
    batches: &BatchLabels,
    means: &DMatrix<f64>,
    variances: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let expected = (residuals.nrows(), batches.n_batches());
    for m in [means, variances] {
        if m.shape() != expected {
            return Err(BatchError::DimensionMismatch {
                expected: expected.0 * expected.1,
                actual: m.nrows() * m.ncols(),
            });
        }
    }
    if batches.n_samples() != residuals.ncols() {
        return Err(BatchError::DimensionMismatch {
            expected: residuals.ncols(),
            actual: batches.n_samples(),
        });
    }
    if variances.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
        return Err(BatchError::Numerical(
            "Batch variances must be finite and positive".to_string(),
        ));
    }

    let codes = batches.codes();
    Ok(DMatrix::from_fn(residuals.nrows(), residuals.ncols(), |i, j| {
        let b = codes[j];
        (residuals[(i, j)] - means[(i, b)]) / variances[(i, b)].sqrt()
    }))
}
