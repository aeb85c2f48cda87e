//! Composable Batch-Effect Correction Library
//!
//! This library provides modular primitives for removing technical batch
//! effects from feature × sample matrices (omics-style data) while
//! preserving biological covariates.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (ExpressionMatrix, Metadata, BatchLabels, DesignMatrix)
//! - **normalize**: Per-feature standardization and reconstruction
//! - **model**: Least-squares design regression (pseudo-inverse)
//! - **correct**: Batch alignment and Empirical Bayes (ComBat) shrinkage
//! - **evaluate**: Nearest-neighbour consistency and PCA diagnostics
//! - **benchmark**: Synthetic data with known batch effects
//! - **pipeline**: Pipeline composition and execution
//!
//! # Example
//!
//! ```no_run
//! use composable_batch::prelude::*;
//!
//! // Load data
//! let matrix = ExpressionMatrix::from_tsv("matrix.tsv").unwrap();
//! let metadata = Metadata::from_tsv("metadata.tsv").unwrap();
//!
//! // Remove batch effects, keeping the group effect
//! let corrected = Pipeline::new()
//!     .standardize()
//!     .regress_design("~ group")
//!     .shrink_combat("batch", EbConfig::default())
//!     .reconstruct()
//!     .run(&matrix, &metadata)
//!     .unwrap();
//!
//! println!("{}", corrected.summary());
//! ```

pub mod benchmark;
pub mod correct;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod stats;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::benchmark::{simulate, SimulatedData, SimulationConfig};
    pub use crate::correct::{
        align_batches, batch_align, combat, estimate_batch_moments, pooled_residual_variance,
        shrink_moments, AlignOptions, BatchMoments, BatchPrior, BatchSummary, Correction,
        CorrectionMethod, CorrectionSummary, EbConfig, ShapeConvention, ShrunkEstimates,
    };
    pub use crate::data::{
        BatchLabels, DesignMatrix, ExpressionMatrix, Formula, Metadata, SingletonPolicy,
        Variable, VariableType,
    };
    pub use crate::error::{BatchError, Result};
    pub use crate::evaluate::{
        nn_consistency, nn_consistency_zscored, nn_summary, pca, NnRow, NnSummary,
        PcaProjection,
    };
    pub use crate::model::{fit_design, DesignFit};
    pub use crate::normalize::{reconstruct, standardize_features, Standardized};
    pub use crate::pipeline::{run_batch_align, run_combat, Pipeline, PipelineConfig, PipelineStep};
}
