//! Design matrices encoding covariates whose effect is preserved.

use crate::data::{Formula, Metadata, Variable, VariableType};
use crate::error::{BatchError, Result};
use nalgebra::DMatrix;

/// A design matrix (samples × covariates), aligned to the sample axis.
///
/// Any intercept is an explicit column of ones.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    column_names: Vec<String>,
    sample_ids: Vec<String>,
}

impl DesignMatrix {
    /// Wrap an existing matrix.
    pub fn from_matrix(
        matrix: DMatrix<f64>,
        column_names: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        if matrix.nrows() != sample_ids.len() {
            return Err(BatchError::DimensionMismatch {
                expected: matrix.nrows(),
                actual: sample_ids.len(),
            });
        }
        if matrix.ncols() != column_names.len() {
            return Err(BatchError::DimensionMismatch {
                expected: matrix.ncols(),
                actual: column_names.len(),
            });
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(BatchError::Numerical(
                "Design matrix contains non-finite values".to_string(),
            ));
        }
        Ok(Self {
            matrix,
            column_names,
            sample_ids,
        })
    }

    /// A single intercept column of ones.
    pub fn intercept_only(sample_ids: Vec<String>) -> Self {
        Self {
            matrix: DMatrix::from_element(sample_ids.len(), 1, 1.0),
            column_names: vec!["(Intercept)".to_string()],
            sample_ids,
        }
    }

    /// Build from a formula over sample metadata.
    ///
    /// Rows follow `sample_ids`. Categorical covariates are dummy-coded; with
    /// an intercept the first sorted level is the reference and is dropped.
    pub fn from_formula(
        metadata: &Metadata,
        formula: &Formula,
        sample_ids: &[String],
    ) -> Result<Self> {
        let metadata = metadata.align_to(sample_ids)?;
        let n_samples = sample_ids.len();

        let mut column_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        if formula.intercept {
            column_names.push("(Intercept)".to_string());
            columns.push(vec![1.0; n_samples]);
        }

        for name in &formula.covariates {
            let values = metadata.column(name)?;
            if let Some(j) = values.iter().position(Variable::is_missing) {
                return Err(BatchError::MissingValue {
                    sample: sample_ids[j].clone(),
                    column: name.clone(),
                });
            }

            match metadata.column_type(name) {
                Some(VariableType::Continuous) => {
                    column_names.push(name.clone());
                    columns.push(values.iter().filter_map(Variable::as_continuous).collect());
                }
                Some(VariableType::Categorical) | None => {
                    let levels = metadata.levels(name)?;
                    let skip = usize::from(formula.intercept);
                    for level in levels.iter().skip(skip) {
                        column_names.push(format!("{}{}", name, level));
                        columns.push(
                            values
                                .iter()
                                .map(|v| {
                                    if v.as_label().as_deref() == Some(level.as_str()) {
                                        1.0
                                    } else {
                                        0.0
                                    }
                                })
                                .collect(),
                        );
                    }
                }
            }
        }

        let matrix = DMatrix::from_fn(n_samples, columns.len(), |i, j| columns[j][i]);
        Self::from_matrix(matrix, column_names, sample_ids.to_vec())
    }

    /// The raw matrix (samples × covariates).
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_covariates(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|n| n == name)
    }

    pub fn has_intercept(&self) -> bool {
        self.column_names.iter().any(|n| n == "(Intercept)")
    }

    /// Reorder rows to follow `sample_ids`.
    ///
    /// Every requested sample must be present; extra design rows are dropped.
    pub fn align_to(&self, sample_ids: &[String]) -> Result<Self> {
        if self.sample_ids.as_slice() == sample_ids {
            return Ok(self.clone());
        }
        let rows = sample_ids
            .iter()
            .map(|sid| {
                self.sample_ids.iter().position(|s| s == sid).ok_or_else(|| {
                    BatchError::SampleMismatch(format!("Sample '{}' not in design", sid))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let matrix = self.matrix.select_rows(rows.iter());
        Ok(Self {
            matrix,
            column_names: self.column_names.clone(),
            sample_ids: sample_ids.to_vec(),
        })
    }
}
