//! Feature standardization.
//!
//! Every correction method works on z-scored features and maps the corrected
//! values back to the original scale at the end:
//!
//! - **zscore**: per-feature standardization, its inverse, and the final
//!   recombination of design fit and corrected residuals

pub mod zscore;

pub use zscore::{reconstruct, standardize_features, Standardized};
