//! Pipeline composition and execution for batch-effect correction.

mod runner;

pub use runner::{run_batch_align, run_combat, Pipeline, PipelineConfig, PipelineStep};
