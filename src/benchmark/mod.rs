//! Benchmarking utilities for evaluating batch-correction methods.
//!
//! Generates synthetic data with known batch distortions and biological
//! signal, so corrections can be scored against ground truth.

mod simulate;

pub use simulate::{simulate, SimulatedData, SimulationConfig};
