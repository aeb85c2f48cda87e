//! Per-sample batch assignments.

use crate::data::Metadata;
use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// How to treat a batch holding a single sample (variance undefined).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingletonPolicy {
    /// Refuse to correct; return `BatchError::DegenerateBatch`.
    #[default]
    Reject,
    /// Accept the batch and use unit variance for it.
    UnitVariance,
}

/// Categorical batch label for every sample, aligned to the sample axis.
///
/// Levels are the sorted distinct labels (by value when every label is
/// numeric); a batch is referred to by its level index.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLabels {
    labels: Vec<String>,
    levels: Vec<String>,
    /// Level index for each sample.
    codes: Vec<usize>,
    /// Sample columns for each level.
    members: Vec<Vec<usize>>,
}

impl BatchLabels {
    /// Build from one label per sample.
    pub fn new<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        if labels.is_empty() {
            return Err(BatchError::EmptyData("No batch labels".to_string()));
        }
        let labels: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        let mut levels: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        // All-numeric labels order by value ("2" before "10")
        let numeric: Option<Vec<f64>> = levels.iter().map(|l| l.parse::<f64>().ok()).collect();
        if let Some(values) = numeric {
            let mut keyed: Vec<(f64, String)> = values.into_iter().zip(levels).collect();
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            levels = keyed.into_iter().map(|(_, l)| l).collect();
        }

        let index: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();
        let mut members = vec![Vec::new(); levels.len()];
        let mut codes = Vec::with_capacity(labels.len());
        for (j, label) in labels.iter().enumerate() {
            // every label is a level
            let code = index.get(label.as_str()).copied().unwrap_or_default();
            codes.push(code);
            members[code].push(j);
        }

        Ok(Self {
            labels,
            levels,
            codes,
            members,
        })
    }

    /// Read a batch column from metadata, in the order of `sample_ids`.
    pub fn from_metadata(metadata: &Metadata, column: &str, sample_ids: &[String]) -> Result<Self> {
        let aligned = metadata.align_to(sample_ids)?;
        let labels = aligned
            .column(column)?
            .iter()
            .zip(sample_ids)
            .map(|(v, sid)| {
                v.as_label().ok_or_else(|| BatchError::MissingValue {
                    sample: sid.clone(),
                    column: column.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(&labels)
    }

    /// Number of samples labelled.
    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    /// Number of distinct batches.
    pub fn n_batches(&self) -> usize {
        self.levels.len()
    }

    /// Sorted batch names.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Raw per-sample labels.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Level index of each sample.
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    /// Sample columns belonging to batch `level`.
    pub fn indices(&self, level: usize) -> &[usize] {
        &self.members[level]
    }

    /// Sample count per batch.
    pub fn sizes(&self) -> Vec<usize> {
        self.members.iter().map(Vec::len).collect()
    }

    /// Label of a sample.
    pub fn label_of(&self, sample: usize) -> Option<&str> {
        self.labels.get(sample).map(String::as_str)
    }

    /// Check alignment with a matrix and the minimum batch size.
    pub fn validate(&self, n_samples: usize, policy: SingletonPolicy) -> Result<()> {
        if self.n_samples() != n_samples {
            return Err(BatchError::DimensionMismatch {
                expected: n_samples,
                actual: self.n_samples(),
            });
        }
        for (level, members) in self.levels.iter().zip(&self.members) {
            if members.len() < 2 {
                match policy {
                    SingletonPolicy::Reject => {
                        return Err(BatchError::DegenerateBatch {
                            batch: level.clone(),
                            size: members.len(),
                        });
                    }
                    SingletonPolicy::UnitVariance => {
                        log::warn!(
                            "batch '{}' has a single sample; using unit variance",
                            level
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
