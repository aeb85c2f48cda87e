//! Principal components of samples, for before/after comparisons.

use crate::data::ensure_finite;
use crate::error::{BatchError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Samples projected onto their leading principal components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaProjection {
    /// Coordinates (samples × components).
    #[serde(skip)]
    pub coords: DMatrix<f64>,
    /// Share of total variance per component, descending.
    pub explained_variance_ratio: Vec<f64>,
}

impl PcaProjection {
    pub fn n_components(&self) -> usize {
        self.explained_variance_ratio.len()
    }

    /// Summed variance ratio of the first `k` components.
    pub fn variance_explained(&self, k: usize) -> f64 {
        self.explained_variance_ratio.iter().take(k).sum()
    }
}

/// PCA over samples (columns) after scaling each feature to zero mean and
/// unit population variance.
///
/// Component signs are fixed so the largest-magnitude loading is positive.
pub fn pca(x: &DMatrix<f64>, n_components: usize) -> Result<PcaProjection> {
    ensure_finite(x)?;
    let (n_features, n_samples) = x.shape();
    let max_components = n_features.min(n_samples);
    if n_components == 0 || n_components > max_components {
        return Err(BatchError::InvalidParameter(format!(
            "n_components must be in 1..={}, got {}",
            max_components, n_components
        )));
    }

    // samples × features, each feature centered and scaled
    let mut a = x.transpose();
    for mut col in a.column_iter_mut() {
        let m = col.mean();
        col.add_scalar_mut(-m);
        let sd = (col.norm_squared() / n_samples as f64).sqrt();
        if sd > 0.0 {
            col.unscale_mut(sd);
        }
    }

    let svd = a.clone().svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| BatchError::Numerical("SVD did not return right vectors".to_string()))?;
    let singular = svd.singular_values;

    let total: f64 = singular.iter().map(|s| s * s).sum();
    let mut order: Vec<usize> = (0..singular.len()).collect();
    order.sort_by(|&p, &q| singular[q].total_cmp(&singular[p]));

    let mut coords = DMatrix::zeros(n_samples, n_components);
    let mut ratios = Vec::with_capacity(n_components);
    for (c, &idx) in order.iter().take(n_components).enumerate() {
        let mut v: DVector<f64> = v_t.row(idx).transpose();
        let pivot = v.iter().copied().fold(0.0_f64, |best, x| {
            if x.abs() > best.abs() {
                x
            } else {
                best
            }
        });
        if pivot < 0.0 {
            v.neg_mut();
        }
        coords.set_column(c, &(&a * &v));
        ratios.push(if total > 0.0 {
            singular[idx] * singular[idx] / total
        } else {
            0.0
        });
    }

    log::debug!(
        "pca: {} samples, {} features, leading ratio {:.3}",
        n_samples,
        n_features,
        ratios.first().copied().unwrap_or(0.0)
    );

    Ok(PcaProjection {
        coords,
        explained_variance_ratio: ratios,
    })
}
