//! Whole-matrix correction: standardize, regress the design, adjust batches,
//! reconstruct.

use crate::correct::empirical_bayes::{
    pooled_residual_variance, shrink_moments, BatchPrior, EbConfig, ShrunkEstimates,
};
use crate::correct::location_scale::{align_batches, estimate_batch_moments, BatchMoments};
use crate::data::{BatchLabels, DesignMatrix, ExpressionMatrix, SingletonPolicy};
use crate::error::Result;
use crate::model::{fit_design, DesignFit};
use crate::normalize::{reconstruct, standardize_features, Standardized};
use crate::stats::mean;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch adjustment applied to the residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionMethod {
    /// Raw per-batch mean/variance alignment.
    BatchAlign,
    /// Empirical Bayes shrunk alignment.
    ComBat,
}

impl CorrectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            CorrectionMethod::BatchAlign => "batch_align",
            CorrectionMethod::ComBat => "combat",
        }
    }
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Options shared by both correction methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Treatment of single-sample batches.
    pub singleton_policy: SingletonPolicy,
}

impl AlignOptions {
    pub fn with_singleton_policy(mut self, policy: SingletonPolicy) -> Self {
        self.singleton_policy = policy;
        self
    }
}

/// A corrected matrix plus every intermediate estimate behind it.
#[derive(Debug, Clone)]
pub struct Correction {
    /// Corrected values, same ids and shape as the input.
    pub matrix: ExpressionMatrix,
    pub method: CorrectionMethod,
    /// Per-feature mean and sd used to standardize and reconstruct.
    pub standardization: Standardized,
    /// Design regression on the standardized scale.
    pub design: DesignFit,
    /// Raw per-batch residual moments.
    pub moments: BatchMoments,
    /// Shrunk moments; present for ComBat only.
    pub shrunk: Option<ShrunkEstimates>,
}

impl Correction {
    /// Corrected values (features × samples).
    pub fn corrected(&self) -> &DMatrix<f64> {
        self.matrix.data()
    }

    pub fn summary(&self) -> CorrectionSummary {
        let batches = (0..self.moments.n_batches())
            .map(|b| {
                let means = self.moments.batch_means(b);
                let abs_means: Vec<f64> = means.iter().map(|m| m.abs()).collect();
                BatchSummary {
                    batch: self.moments.levels[b].clone(),
                    n_samples: self.moments.sizes[b],
                    mean_abs_shift: mean(&abs_means),
                    mean_variance: mean(&self.moments.batch_variances(b)),
                    mean_weight: self.shrunk.as_ref().map(|s| s.mean_weight(b)),
                    prior: self.shrunk.as_ref().and_then(|s| s.priors.get(b).cloned()),
                }
            })
            .collect();

        CorrectionSummary {
            method: self.method,
            n_features: self.matrix.n_features(),
            n_samples: self.matrix.n_samples(),
            design_columns: self.design.coefficient_names.clone(),
            design_rank: self.design.rank,
            batches,
        }
    }
}

/// Per-batch line of a correction summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch: String,
    pub n_samples: usize,
    /// Mean |residual batch mean| across features.
    pub mean_abs_shift: f64,
    /// Mean residual batch variance across features.
    pub mean_variance: f64,
    /// Mean weight of the raw batch mean (ComBat only).
    pub mean_weight: Option<f64>,
    pub prior: Option<BatchPrior>,
}

/// Serializable overview of a correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionSummary {
    pub method: CorrectionMethod,
    pub n_features: usize,
    pub n_samples: usize,
    pub design_columns: Vec<String>,
    pub design_rank: usize,
    pub batches: Vec<BatchSummary>,
}

impl CorrectionSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for CorrectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Correction: {}", self.method)?;
        writeln!(f, "  Features: {}", self.n_features)?;
        writeln!(f, "  Samples: {}", self.n_samples)?;
        if self.design_columns.is_empty() {
            writeln!(f, "  Design: none")?;
        } else {
            writeln!(
                f,
                "  Design: {} (rank {})",
                self.design_columns.join(", "),
                self.design_rank
            )?;
        }
        for b in &self.batches {
            write!(
                f,
                "  {}: n={}, |shift|={:.3}, var={:.3}",
                b.batch, b.n_samples, b.mean_abs_shift, b.mean_variance
            )?;
            if let Some(w) = b.mean_weight {
                write!(f, ", weight={:.3}", w)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Standardize and regress the design; shared front half of both methods.
fn prepare(
    matrix: &ExpressionMatrix,
    batches: &BatchLabels,
    design: Option<&DesignMatrix>,
    options: &AlignOptions,
) -> Result<(Standardized, DesignFit)> {
    batches.validate(matrix.n_samples(), options.singleton_policy)?;
    let design = design
        .map(|d| d.align_to(matrix.sample_ids()))
        .transpose()?;

    let standardized = standardize_features(matrix.data())?;
    let fit = fit_design(&standardized.data, design.as_ref())?;
    Ok((standardized, fit))
}

/// Remove batch location/scale effects by aligning raw per-batch moments.
///
/// Each feature is standardized, the design component is fitted and set
/// aside, every batch's residuals are centered and scaled to unit variance,
/// and the design component is added back before returning to the original
/// scale.
///
/// # Arguments
/// * `matrix` - Expression values (features × samples)
/// * `batches` - Batch label per sample, in matrix column order
/// * `design` - Covariates whose effect must survive; rows are matched by sample id
/// * `options` - Singleton batch handling
pub fn batch_align(
    matrix: &ExpressionMatrix,
    batches: &BatchLabels,
    design: Option<&DesignMatrix>,
    options: &AlignOptions,
) -> Result<Correction> {
    let (standardized, fit) = prepare(matrix, batches, design, options)?;
    let moments = estimate_batch_moments(&fit.residuals, batches)?;
    let aligned = align_batches(&fit.residuals, batches, &moments.means, &moments.variances)?;
    let corrected = reconstruct(&fit.fitted, &aligned, &standardized)?;

    log::info!(
        "batch_align: {} features, {} samples, {} batches",
        matrix.n_features(),
        matrix.n_samples(),
        batches.n_batches()
    );

    Ok(Correction {
        matrix: matrix.with_data(corrected)?,
        method: CorrectionMethod::BatchAlign,
        standardization: standardized,
        design: fit,
        moments,
        shrunk: None,
    })
}

/// Remove batch effects with Empirical Bayes shrunk location/scale estimates.
///
/// Same pipeline as [`batch_align`], except the per-batch means and variances
/// are pulled toward per-batch priors before the residuals are adjusted.
pub fn combat(
    matrix: &ExpressionMatrix,
    batches: &BatchLabels,
    design: Option<&DesignMatrix>,
    options: &AlignOptions,
    config: &EbConfig,
) -> Result<Correction> {
    config.validate()?;
    let (standardized, fit) = prepare(matrix, batches, design, options)?;
    let moments = estimate_batch_moments(&fit.residuals, batches)?;
    let residual_variance = pooled_residual_variance(&fit.residuals, config.eps);
    let shrunk = shrink_moments(&moments, &residual_variance, config)?;
    let adjusted = align_batches(&fit.residuals, batches, &shrunk.gamma_star, &shrunk.delta_star)?;
    let corrected = reconstruct(&fit.fitted, &adjusted, &standardized)?;

    log::info!(
        "combat: {} features, {} samples, {} batches",
        matrix.n_features(),
        matrix.n_samples(),
        batches.n_batches()
    );

    Ok(Correction {
        matrix: matrix.with_data(corrected)?,
        method: CorrectionMethod::ComBat,
        standardization: standardized,
        design: fit,
        moments,
        shrunk: Some(shrunk),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Formula;
    use crate::data::Metadata;
    use crate::error::BatchError;
    use approx::assert_relative_eq;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i + 1)).collect()
    }

    /// Two batches of three; batch "b" shifted by +3 on every feature.
    fn create_shifted() -> (ExpressionMatrix, BatchLabels) {
        let data = DMatrix::from_row_slice(3, 6, &[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
            0.5, -0.5, 0.0, 3.5, 2.5, 3.0,
            5.0, 5.0, 5.0, 5.0, 5.0, 5.0,
        ]);
        let matrix = ExpressionMatrix::new(data, ids("F", 3), ids("S", 6)).unwrap();
        let batches = BatchLabels::new(&["a", "a", "a", "b", "b", "b"]).unwrap();
        (matrix, batches)
    }

    fn batch_mean(m: &DMatrix<f64>, feature: usize, cols: &[usize]) -> f64 {
        cols.iter().map(|&j| m[(feature, j)]).sum::<f64>() / cols.len() as f64
    }

    #[test]
    fn test_batch_align_removes_shift() {
        let (matrix, batches) = create_shifted();
        let c = batch_align(&matrix, &batches, None, &AlignOptions::default()).unwrap();
        let x = c.corrected();

        for i in 0..2 {
            let a = batch_mean(x, i, batches.indices(0));
            let b = batch_mean(x, i, batches.indices(1));
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
        // Constant feature is untouched
        assert!(x.row(2).iter().all(|&v| v == 5.0));
        assert_eq!(c.matrix.sample_ids(), matrix.sample_ids());
        assert!(c.shrunk.is_none());
    }

    #[test]
    fn test_feature_means_preserved_without_design() {
        let (matrix, batches) = create_shifted();
        let c = batch_align(&matrix, &batches, None, &AlignOptions::default()).unwrap();
        for i in 0..matrix.n_features() {
            let before = mean(&matrix.row(i));
            let after = mean(&c.matrix.row(i));
            assert_relative_eq!(before, after, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_combat_constant_feature_and_shift() {
        let (matrix, batches) = create_shifted();
        let c = combat(
            &matrix,
            &batches,
            None,
            &AlignOptions::default(),
            &EbConfig::default(),
        )
        .unwrap();
        let x = c.corrected();
        assert!(x.row(2).iter().all(|&v| (v - 5.0).abs() < 1e-6));

        let before = (batch_mean(matrix.data(), 0, batches.indices(1))
            - batch_mean(matrix.data(), 0, batches.indices(0)))
        .abs();
        let after =
            (batch_mean(x, 0, batches.indices(1)) - batch_mean(x, 0, batches.indices(0))).abs();
        assert!(after < before);
        assert_eq!(c.summary().batches[0].prior.as_ref().unwrap().batch, "a");
    }

    #[test]
    fn test_singleton_policy() {
        let data = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 4.0]);
        let matrix = ExpressionMatrix::new(data, ids("F", 1), ids("S", 3)).unwrap();
        let batches = BatchLabels::new(&["a", "a", "b"]).unwrap();

        let err = batch_align(&matrix, &batches, None, &AlignOptions::default()).unwrap_err();
        assert!(matches!(err, BatchError::DegenerateBatch { ref batch, size: 1 } if batch == "b"));

        let options = AlignOptions::default().with_singleton_policy(SingletonPolicy::UnitVariance);
        let c = batch_align(&matrix, &batches, None, &options).unwrap();
        assert!(c.corrected().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_design_rows_matched_by_sample_id() {
        let (matrix, batches) = create_shifted();
        let mut meta = Metadata::new(ids("S", 6));
        meta.insert_categorical("group", &["x", "y", "x", "y", "x", "y"]).unwrap();
        let formula = Formula::parse("~ group").unwrap();

        let ordered = DesignMatrix::from_formula(&meta, &formula, matrix.sample_ids()).unwrap();
        let reversed_ids: Vec<String> = matrix.sample_ids().iter().rev().cloned().collect();
        let reversed = DesignMatrix::from_formula(&meta, &formula, &reversed_ids).unwrap();

        let opts = AlignOptions::default();
        let a = batch_align(&matrix, &batches, Some(&ordered), &opts).unwrap();
        let b = batch_align(&matrix, &batches, Some(&reversed), &opts).unwrap();
        for (x, y) in a.corrected().iter().zip(b.corrected().iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-10);
        }
        assert_eq!(a.summary().design_columns, vec!["(Intercept)", "groupy"]);
    }

    #[test]
    fn test_label_count_mismatch() {
        let (matrix, _) = create_shifted();
        let batches = BatchLabels::new(&["a", "a", "b", "b"]).unwrap();
        assert!(matches!(
            batch_align(&matrix, &batches, None, &AlignOptions::default()),
            Err(BatchError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_summary_json() {
        let (matrix, batches) = create_shifted();
        let c = batch_align(&matrix, &batches, None, &AlignOptions::default()).unwrap();
        let summary = c.summary();
        assert_eq!(summary.batches.len(), 2);
        assert_eq!(summary.n_samples, 6);
        let json = summary.to_json().unwrap();
        assert!(json.contains("\"BatchAlign\""));
        assert!(summary.to_string().contains("Correction: batch_align"));
    }
}
