//! Batch-effect correction of residuals and whole matrices.

pub mod empirical_bayes;
pub mod location_scale;
mod method;

pub use empirical_bayes::{
    pooled_residual_variance, shrink_moments, BatchPrior, EbConfig, ShapeConvention,
    ShrunkEstimates,
};
pub use location_scale::{align_batches, estimate_batch_moments, BatchMoments};
pub use method::{
    batch_align, combat, AlignOptions, BatchSummary, Correction, CorrectionMethod,
    CorrectionSummary,
};
