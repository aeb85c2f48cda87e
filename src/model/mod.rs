//! Models of the biological signal to preserve through correction.

pub mod ols;

pub use ols::{fit_design, pinv_tolerance, DesignFit};
