//! Diagnostics for judging a correction: neighbour consistency and PCA.

mod neighbors;
mod pca;

pub use neighbors::{
    nn_consistency, nn_consistency_zscored, nn_summary, sample_distances, NnRow, NnSummary,
};
pub use pca::{pca, PcaProjection};
