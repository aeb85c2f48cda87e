//! Empirical Bayes shrinkage of per-batch location/scale estimates.
//!
//! Per-feature batch means and variances are noisy when batches are small.
//! Each batch gets a normal prior on its means (pooled across features) and
//! an inverse-gamma prior on its variances, fitted by the method of moments.
//! The posterior estimates pull the raw moments toward those priors, with
//! less pull as the batch grows.
//!
//! This is the ComBat adjustment (Johnson, Li & Rabinovic 2007), in its
//! closed-form single-pass variant.

use crate::correct::location_scale::BatchMoments;
use crate::error::{BatchError, Result};
use crate::stats::{mean, sample_variance};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Sample-count term used for the posterior inverse-gamma shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShapeConvention {
    /// a* = a + n/2 (n floored at 1).
    #[default]
    SampleCount,
    /// a* = a + (n − 1)/2, matching the residual degrees of freedom.
    ResidualDf,
}

/// Configuration for Empirical Bayes shrinkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EbConfig {
    /// Added to the pooled residual variance and to denominators (default: 1e-8).
    pub eps: f64,
    /// Prior variance of batch means at or below this is replaced (default: 1e-6).
    pub tau2_floor: f64,
    /// Replacement prior variance of batch means (default: 1e-3).
    pub tau2_fallback: f64,
    /// Variance of batch variances at or below this is replaced (default: 1e-12).
    pub var_floor: f64,
    /// Replacement is `mean² × var_fallback_scale` (default: 10).
    pub var_fallback_scale: f64,
    /// Lower bound on a* − 1 (default: 1.0001).
    pub shape_floor: f64,
    /// Lower clip of shrunk variances (default: 1e-3).
    pub delta_min: f64,
    /// Upper clip of shrunk variances (default: 1e3).
    pub delta_max: f64,
    /// Shape update convention.
    pub shape_convention: ShapeConvention,
}

impl Default for EbConfig {
    fn default() -> Self {
        Self {
            eps: 1e-8,
            tau2_floor: 1e-6,
            tau2_fallback: 1e-3,
            var_floor: 1e-12,
            var_fallback_scale: 10.0,
            shape_floor: 1.0001,
            delta_min: 1e-3,
            delta_max: 1e3,
            shape_convention: ShapeConvention::SampleCount,
        }
    }
}

impl EbConfig {
    pub fn with_shape_convention(mut self, convention: ShapeConvention) -> Self {
        self.shape_convention = convention;
        self
    }

    /// Set the clip range for shrunk variances.
    pub fn with_delta_bounds(mut self, min: f64, max: f64) -> Self {
        self.delta_min = min;
        self.delta_max = max;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Reject settings that would break the posterior formulas.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("eps", self.eps),
            ("tau2_fallback", self.tau2_fallback),
            ("var_fallback_scale", self.var_fallback_scale),
            ("delta_min", self.delta_min),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(BatchError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.tau2_floor >= 0.0 && self.var_floor >= 0.0) {
            return Err(BatchError::InvalidParameter(
                "Variance floors must be non-negative".to_string(),
            ));
        }
        if !(self.shape_floor > 0.0) {
            return Err(BatchError::InvalidParameter(format!(
                "shape_floor must be positive, got {}",
                self.shape_floor
            )));
        }
        if !(self.delta_max >= self.delta_min) {
            return Err(BatchError::InvalidParameter(format!(
                "delta_max ({}) is below delta_min ({})",
                self.delta_max, self.delta_min
            )));
        }
        Ok(())
    }
}

/// Hyperparameters fitted for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPrior {
    pub batch: String,
    pub n_samples: usize,
    /// Prior mean of the batch location (γ̄).
    pub gamma_bar: f64,
    /// Prior variance of the batch location (τ², after flooring).
    pub tau2: f64,
    /// Inverse-gamma prior shape.
    pub shape: f64,
    /// Inverse-gamma prior scale.
    pub scale: f64,
}

/// Shrunk location/scale estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShrunkEstimates {
    /// Posterior batch means (features × batches).
    #[serde(skip)]
    pub gamma_star: DMatrix<f64>,
    /// Posterior batch variances, clipped (features × batches).
    #[serde(skip)]
    pub delta_star: DMatrix<f64>,
    /// Weight of the raw mean in γ*; 1 is no shrinkage (features × batches).
    #[serde(skip)]
    pub mean_weights: DMatrix<f64>,
    pub priors: Vec<BatchPrior>,
}

impl ShrunkEstimates {
    /// Average weight of the raw mean for one batch.
    pub fn mean_weight(&self, level: usize) -> f64 {
        let col: Vec<f64> = self.mean_weights.column(level).iter().copied().collect();
        mean(&col)
    }
}

/// Sample variance of each residual row plus `eps`.
///
/// This is the per-feature scale the batch-mean prior variance is compared
/// against.
pub fn pooled_residual_variance(residuals: &DMatrix<f64>, eps: f64) -> Vec<f64> {
    (0..residuals.nrows())
        .map(|i| {
            let row: Vec<f64> = residuals.row(i).iter().copied().collect();
            let v = sample_variance(&row);
            if v.is_finite() {
                v + eps
            } else {
                eps
            }
        })
        .collect()
}

/// Shrink raw batch moments toward per-batch priors.
///
/// # Arguments
/// * `moments` - Raw per-batch means and variances
/// * `residual_variance` - Pooled per-feature residual variance (one per feature)
/// * `config` - Floors, clips and shape convention
///
/// # Returns
/// Posterior means γ*, clipped posterior variances δ*, and the fitted priors.
pub fn shrink_moments(
    moments: &BatchMoments,
    residual_variance: &[f64],
    config: &EbConfig,
) -> Result<ShrunkEstimates> {
    config.validate()?;
    let n_features = moments.n_features();
    let n_batches = moments.n_batches();
    if residual_variance.len() != n_features {
        return Err(BatchError::DimensionMismatch {
            expected: n_features,
            actual: residual_variance.len(),
        });
    }

    let mut gamma_star = DMatrix::zeros(n_features, n_batches);
    let mut delta_star = DMatrix::zeros(n_features, n_batches);
    let mut mean_weights = DMatrix::zeros(n_features, n_batches);
    let mut priors = Vec::with_capacity(n_batches);

    for b in 0..n_batches {
        let n = moments.sizes[b];
        let gamma_hat = moments.batch_means(b);
        let delta_hat = moments.batch_variances(b);

        // Location prior, pooled over features
        let gamma_bar = mean(&gamma_hat);
        let tau2 = sample_variance(&gamma_hat);
        let tau2 = if tau2 > config.tau2_floor {
            tau2
        } else {
            config.tau2_fallback
        };

        // Scale prior: method-of-moments inverse gamma
        let m = mean(&delta_hat);
        let v = sample_variance(&delta_hat);
        let v = if v > config.var_floor {
            v
        } else {
            m * m * config.var_fallback_scale
        };
        let shape = 2.0 + m * m / v;
        let scale = m * (shape - 1.0);
        if !(shape.is_finite() && scale.is_finite()) {
            return Err(BatchError::Numerical(format!(
                "Variance prior for batch '{}' is not finite",
                moments.levels[b]
            )));
        }

        let n_eff = n.max(1) as f64;
        let df = n.saturating_sub(1) as f64;
        let shape_post = match config.shape_convention {
            ShapeConvention::SampleCount => shape + 0.5 * n_eff,
            ShapeConvention::ResidualDf => shape + 0.5 * df,
        };
        let denom = (shape_post - 1.0).max(config.shape_floor);

        for i in 0..n_features {
            let s2 = residual_variance[i] / n_eff;
            let total = tau2 + s2 + config.eps;
            gamma_star[(i, b)] = (tau2 * gamma_hat[i] + s2 * gamma_bar) / total;
            mean_weights[(i, b)] = tau2 / total;

            let scale_post = scale + 0.5 * df * delta_hat[i];
            delta_star[(i, b)] = (scale_post / denom).clamp(config.delta_min, config.delta_max);
        }

        log::debug!(
            "batch '{}': n = {}, gamma_bar = {:.4}, tau2 = {:.4}, shape = {:.3}, scale = {:.3}",
            moments.levels[b],
            n,
            gamma_bar,
            tau2,
            shape,
            scale
        );

        priors.push(BatchPrior {
            batch: moments.levels[b].clone(),
            n_samples: n,
            gamma_bar,
            tau2,
            shape,
            scale,
        });
    }

    Ok(ShrunkEstimates {
        gamma_star,
        delta_star,
        mean_weights,
        priors,
    })
}
