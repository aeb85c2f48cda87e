//! Least-squares removal of design effects from standardized data.

use crate::data::DesignMatrix;
use crate::error::{BatchError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Cutoff below which singular values of `x` are treated as zero.
///
/// Relative to the largest singular value, so the covariates' units do not
/// decide the rank.
pub fn pinv_tolerance(x: &DMatrix<f64>, sigma_max: f64) -> f64 {
    sigma_max * x.nrows().max(x.ncols()) as f64 * f64::EPSILON
}

/// Split of standardized data into a design-explained part and a residual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignFit {
    /// Design component, D·β for every feature (features × samples).
    #[serde(skip)]
    pub fitted: DMatrix<f64>,
    /// Residual, Z − fitted (features × samples).
    #[serde(skip)]
    pub residuals: DMatrix<f64>,
    /// Coefficients (features × covariates). Empty without a design.
    #[serde(skip)]
    pub coefficients: DMatrix<f64>,
    /// Covariate names, one per coefficient column.
    pub coefficient_names: Vec<String>,
    /// Numerical rank of the design; 0 without a design.
    pub rank: usize,
}

impl DesignFit {
    /// Passthrough fit: nothing is explained.
    pub fn empty(z: &DMatrix<f64>) -> Self {
        Self {
            fitted: DMatrix::zeros(z.nrows(), z.ncols()),
            residuals: z.clone(),
            coefficients: DMatrix::zeros(z.nrows(), 0),
            coefficient_names: Vec::new(),
            rank: 0,
        }
    }

    /// Whether the design has fewer independent columns than covariates.
    pub fn is_rank_deficient(&self) -> bool {
        self.rank < self.coefficient_names.len()
    }

    /// Coefficients of one covariate across features.
    pub fn coefficients_for(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.coefficient_names.iter().position(|n| n == name)?;
        Some(self.coefficients.column(idx).iter().copied().collect())
    }
}

/// Fit every feature of `z` against the design by ordinary least squares.
///
/// β = (DᵀD)⁺ Dᵀ z is solved through an SVD pseudo-inverse of D, so collinear or
/// rank-deficient designs still yield finite coefficients (the minimum-norm
/// solution). Without a design the fit is empty and the residual is `z`.
///
/// # Arguments
/// * `z` - Standardized data (features × samples)
/// * `design` - Optional design matrix (samples × covariates)
pub fn fit_design(z: &DMatrix<f64>, design: Option<&DesignMatrix>) -> Result<DesignFit> {
    let design = match design {
        Some(d) => d,
        None => return Ok(DesignFit::empty(z)),
    };

    let n_samples = z.ncols();
    if design.n_samples() != n_samples {
        return Err(BatchError::DimensionMismatch {
            expected: n_samples,
            actual: design.n_samples(),
        });
    }
    if design.n_covariates() == 0 {
        return Ok(DesignFit::empty(z));
    }

    let x = design.matrix();
    let svd = x.clone().svd(true, true);
    let tolerance = pinv_tolerance(x, svd.singular_values.max());
    let rank = svd.rank(tolerance);
    if rank < design.n_covariates() {
        log::warn!(
            "design has rank {} with {} covariates; using minimum-norm solution",
            rank,
            design.n_covariates()
        );
    }

    // X⁺ = (XᵀX)⁺ Xᵀ, taken from the SVD of X directly
    let x_pinv = svd
        .pseudo_inverse(tolerance)
        .map_err(|e| BatchError::Numerical(format!("Pseudo-inverse failed: {}", e)))?;

    // Row-wise: β_g = X⁺ z_g  =>  B = Z (X⁺)ᵀ
    let coefficients = z * x_pinv.transpose();
    let fitted = &coefficients * x.transpose();
    let residuals = z - &fitted;

    if coefficients.iter().any(|v| !v.is_finite()) {
        return Err(BatchError::Numerical(
            "Design regression produced non-finite coefficients".to_string(),
        ));
    }

    Ok(DesignFit {
        fitted,
        residuals,
        coefficients,
        coefficient_names: design.column_names().to_vec(),
        rank,
    })
}
