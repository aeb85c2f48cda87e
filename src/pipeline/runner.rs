//! Pipeline runner for composing and executing correction steps.

use crate::correct::{
    align_batches, estimate_batch_moments, pooled_residual_variance, shrink_moments,
    AlignOptions, BatchMoments, Correction, CorrectionMethod, EbConfig, ShrunkEstimates,
};
use crate::data::{BatchLabels, DesignMatrix, ExpressionMatrix, Formula, Metadata, SingletonPolicy};
use crate::error::{BatchError, Result};
use crate::model::{fit_design, DesignFit};
use crate::normalize::{reconstruct, standardize_features, Standardized};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A step in the correction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineStep {
    /// Z-score every feature across samples.
    Standardize,
    /// Regress standardized data on a design built from metadata.
    RegressDesign { formula: String },
    /// Align raw per-batch residual moments.
    AlignBatches { batch_column: String },
    /// Align Empirical Bayes shrunk per-batch residual moments.
    ShrinkComBat {
        batch_column: String,
        #[serde(default)]
        config: EbConfig,
    },
    /// Add the design component back and undo standardization.
    Reconstruct,
}

impl PipelineStep {
    fn label(&self) -> &'static str {
        match self {
            PipelineStep::Standardize => "Standardize",
            PipelineStep::RegressDesign { .. } => "RegressDesign",
            PipelineStep::AlignBatches { .. } => "AlignBatches",
            PipelineStep::ShrinkComBat { .. } => "ShrinkComBat",
            PipelineStep::Reconstruct => "Reconstruct",
        }
    }
}

/// Pipeline configuration for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name of the pipeline.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    #[serde(default)]
    pub options: AlignOptions,
    /// Steps to execute.
    pub steps: Vec<PipelineStep>,
}

impl PipelineConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(BatchError::from)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(BatchError::from)
    }
}

/// Builder for constructing and running correction pipelines.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
    name: String,
    options: AlignOptions,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create a new empty pipeline.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            name: "unnamed".to_string(),
            options: AlignOptions::default(),
        }
    }

    /// Create from a config.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            steps: config.steps.clone(),
            name: config.name.clone(),
            options: config.options.clone(),
        }
    }

    /// Set the pipeline name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set how single-sample batches are handled.
    pub fn singleton_policy(mut self, policy: SingletonPolicy) -> Self {
        self.options.singleton_policy = policy;
        self
    }

    /// Add feature standardization.
    pub fn standardize(mut self) -> Self {
        self.steps.push(PipelineStep::Standardize);
        self
    }

    /// Add design regression, e.g. `"~ group"`.
    ///
    /// Without this step the whole standardized matrix is treated as residual.
    pub fn regress_design(mut self, formula: &str) -> Self {
        self.steps.push(PipelineStep::RegressDesign {
            formula: formula.to_string(),
        });
        self
    }

    /// Add raw location/scale batch alignment.
    pub fn align_batches(mut self, batch_column: &str) -> Self {
        self.steps.push(PipelineStep::AlignBatches {
            batch_column: batch_column.to_string(),
        });
        self
    }

    /// Add Empirical Bayes (ComBat) batch alignment.
    pub fn shrink_combat(mut self, batch_column: &str, config: EbConfig) -> Self {
        self.steps.push(PipelineStep::ShrinkComBat {
            batch_column: batch_column.to_string(),
            config,
        });
        self
    }

    /// Add reconstruction to the original scale.
    pub fn reconstruct(mut self) -> Self {
        self.steps.push(PipelineStep::Reconstruct);
        self
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Convert to config for serialization.
    pub fn to_config(&self, description: Option<&str>) -> PipelineConfig {
        PipelineConfig {
            name: self.name.clone(),
            description: description.map(String::from),
            options: self.options.clone(),
            steps: self.steps.clone(),
        }
    }

    /// Run the pipeline on data.
    ///
    /// Metadata rows are matched to matrix columns by sample id.
    pub fn run(&self, matrix: &ExpressionMatrix, metadata: &Metadata) -> Result<Correction> {
        let metadata = metadata.align_to(matrix.sample_ids())?;
        let mut state = PipelineState::new(matrix.clone(), metadata, self.options.clone());

        for (i, step) in self.steps.iter().enumerate() {
            state = state.apply(step).map_err(|e| {
                BatchError::Pipeline(format!("Step {} ({}) failed: {}", i + 1, step.label(), e))
            })?;
        }

        log::debug!("pipeline '{}' finished {} step(s)", self.name, self.steps.len());
        state.finalize()
    }
}

/// Internal state during pipeline execution.
struct PipelineState {
    matrix: ExpressionMatrix,
    metadata: Metadata,
    options: AlignOptions,
    standardized: Option<Standardized>,
    fit: Option<DesignFit>,
    method: Option<CorrectionMethod>,
    moments: Option<BatchMoments>,
    shrunk: Option<ShrunkEstimates>,
    adjusted: Option<DMatrix<f64>>,
    corrected: Option<DMatrix<f64>>,
}

impl PipelineState {
    fn new(matrix: ExpressionMatrix, metadata: Metadata, options: AlignOptions) -> Self {
        Self {
            matrix,
            metadata,
            options,
            standardized: None,
            fit: None,
            method: None,
            moments: None,
            shrunk: None,
            adjusted: None,
            corrected: None,
        }
    }

    fn standardized(&self, before: &str) -> Result<&Standardized> {
        self.standardized.as_ref().ok_or_else(|| {
            BatchError::Pipeline(format!("Must standardize before {}", before))
        })
    }

    fn batches(&self, column: &str) -> Result<BatchLabels> {
        let batches = BatchLabels::from_metadata(&self.metadata, column, self.matrix.sample_ids())?;
        batches.validate(self.matrix.n_samples(), self.options.singleton_policy)?;
        Ok(batches)
    }

    /// Residuals to adjust; falls back to a design-free fit.
    fn take_fit(&mut self) -> Result<DesignFit> {
        if self.adjusted.is_some() {
            return Err(BatchError::Pipeline(
                "Batches have already been adjusted".to_string(),
            ));
        }
        match self.fit.take() {
            Some(fit) => Ok(fit),
            None => Ok(DesignFit::empty(&self.standardized("batch adjustment")?.data)),
        }
    }

    fn apply(mut self, step: &PipelineStep) -> Result<Self> {
        match step {
            PipelineStep::Standardize => {
                if self.standardized.is_some() {
                    return Err(BatchError::Pipeline("Already standardized".to_string()));
                }
                self.standardized = Some(standardize_features(self.matrix.data())?);
            }

            PipelineStep::RegressDesign { formula } => {
                if self.fit.is_some() || self.adjusted.is_some() {
                    return Err(BatchError::Pipeline(
                        "Design must be regressed once, before batch adjustment".to_string(),
                    ));
                }
                let formula = Formula::parse(formula)?;
                let design =
                    DesignMatrix::from_formula(&self.metadata, &formula, self.matrix.sample_ids())?;
                let z = &self.standardized("regressing the design")?.data;
                self.fit = Some(fit_design(z, Some(&design))?);
            }

            PipelineStep::AlignBatches { batch_column } => {
                let batches = self.batches(batch_column)?;
                let fit = self.take_fit()?;
                let moments = estimate_batch_moments(&fit.residuals, &batches)?;
                self.adjusted = Some(align_batches(
                    &fit.residuals,
                    &batches,
                    &moments.means,
                    &moments.variances,
                )?);
                self.moments = Some(moments);
                self.method = Some(CorrectionMethod::BatchAlign);
                self.fit = Some(fit);
            }

            PipelineStep::ShrinkComBat {
                batch_column,
                config,
            } => {
                let batches = self.batches(batch_column)?;
                let fit = self.take_fit()?;
                let moments = estimate_batch_moments(&fit.residuals, &batches)?;
                let residual_variance = pooled_residual_variance(&fit.residuals, config.eps);
                let shrunk = shrink_moments(&moments, &residual_variance, config)?;
                self.adjusted = Some(align_batches(
                    &fit.residuals,
                    &batches,
                    &shrunk.gamma_star,
                    &shrunk.delta_star,
                )?);
                self.moments = Some(moments);
                self.shrunk = Some(shrunk);
                self.method = Some(CorrectionMethod::ComBat);
                self.fit = Some(fit);
            }

            PipelineStep::Reconstruct => {
                let adjusted = self.adjusted.as_ref().ok_or_else(|| {
                    BatchError::Pipeline("Must adjust batches before reconstructing".to_string())
                })?;
                let fit = self.fit.as_ref().ok_or_else(|| {
                    BatchError::Pipeline("Design fit not available".to_string())
                })?;
                let standardized = self.standardized("reconstructing")?;
                self.corrected = Some(reconstruct(&fit.fitted, adjusted, standardized)?);
            }
        }
        Ok(self)
    }

    fn finalize(self) -> Result<Correction> {
        let corrected = self.corrected.ok_or_else(|| {
            BatchError::Pipeline("Pipeline must end with a reconstruct step".to_string())
        })?;
        let missing = |what: &str| BatchError::Pipeline(format!("{} not available", what));

        Ok(Correction {
            matrix: self.matrix.with_data(corrected)?,
            method: self.method.ok_or_else(|| missing("Correction method"))?,
            standardization: self.standardized.ok_or_else(|| missing("Standardization"))?,
            design: self.fit.ok_or_else(|| missing("Design fit"))?,
            moments: self.moments.ok_or_else(|| missing("Batch moments"))?,
            shrunk: self.shrunk,
        })
    }
}

/// Standardize, optionally regress `formula`, align raw batch moments, reconstruct.
pub fn run_batch_align(
    matrix: &ExpressionMatrix,
    metadata: &Metadata,
    batch_column: &str,
    formula: Option<&str>,
) -> Result<Correction> {
    let mut pipeline = Pipeline::new().name("batch_align").standardize();
    if let Some(formula) = formula {
        pipeline = pipeline.regress_design(formula);
    }
    pipeline
        .align_batches(batch_column)
        .reconstruct()
        .run(matrix, metadata)
}

/// Standardize, optionally regress `formula`, align EB-shrunk batch moments, reconstruct.
pub fn run_combat(
    matrix: &ExpressionMatrix,
    metadata: &Metadata,
    batch_column: &str,
    formula: Option<&str>,
    config: &EbConfig,
) -> Result<Correction> {
    let mut pipeline = Pipeline::new().name("combat").standardize();
    if let Some(formula) = formula {
        pipeline = pipeline.regress_design(formula);
    }
    pipeline
        .shrink_combat(batch_column, config.clone())
        .reconstruct()
        .run(matrix, metadata)
}
