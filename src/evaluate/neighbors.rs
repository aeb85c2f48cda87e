//! Nearest-neighbour label consistency.
//!
//! A well-corrected matrix should mix batches (low batch consistency) while
//! keeping biological groups together (high group consistency).

use crate::data::ensure_finite;
use crate::error::{BatchError, Result};
use crate::normalize::standardize_features;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pairwise Euclidean distances between samples (columns).
pub fn sample_distances(x: &DMatrix<f64>) -> DMatrix<f64> {
    let n = x.ncols();
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|a| {
            (0..n)
                .map(|b| (x.column(a) - x.column(b)).norm())
                .collect()
        })
        .collect();
    DMatrix::from_fn(n, n, |a, b| rows[a][b])
}

/// Mean fraction of each sample's `k` nearest neighbours sharing its label.
///
/// Neighbours are other samples (columns) by Euclidean distance; ties go to
/// the lower column index. `k` must be between 1 and `n_samples - 1`.
pub fn nn_consistency<S: AsRef<str> + Sync>(
    x: &DMatrix<f64>,
    labels: &[S],
    k: usize,
) -> Result<f64> {
    ensure_finite(x)?;
    let n = x.ncols();
    if labels.len() != n {
        return Err(BatchError::DimensionMismatch {
            expected: n,
            actual: labels.len(),
        });
    }
    if k == 0 || k >= n {
        return Err(BatchError::InvalidParameter(format!(
            "k must be in 1..{}, got {}",
            n, k
        )));
    }

    let d = sample_distances(x);
    let shared: Vec<usize> = (0..n)
        .into_par_iter()
        .map(|a| {
            let mut others: Vec<usize> = (0..n).filter(|&b| b != a).collect();
            others.sort_by(|&p, &q| d[(a, p)].total_cmp(&d[(a, q)]).then(p.cmp(&q)));
            others
                .iter()
                .take(k)
                .filter(|&&b| labels[b].as_ref() == labels[a].as_ref())
                .count()
        })
        .collect();

    Ok(shared.iter().sum::<usize>() as f64 / (n * k) as f64)
}

/// [`nn_consistency`] after z-scoring every feature across samples.
pub fn nn_consistency_zscored<S: AsRef<str> + Sync>(
    x: &DMatrix<f64>,
    labels: &[S],
    k: usize,
) -> Result<f64> {
    let z = standardize_features(x)?;
    nn_consistency(&z.data, labels, k)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// One condition's neighbour consistency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NnRow {
    pub condition: String,
    /// Consistency with batch labels; lower means better mixing.
    pub batch_nn: f64,
    /// Consistency with group labels; higher means biology is preserved.
    pub group_nn: Option<f64>,
}

/// Neighbour consistency across several matrices, rounded to 3 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NnSummary {
    pub k: usize,
    pub rows: Vec<NnRow>,
}

impl NnSummary {
    pub fn get(&self, condition: &str) -> Option<&NnRow> {
        self.rows.iter().find(|r| r.condition == condition)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for NnSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|r| r.condition.len())
            .max()
            .unwrap_or(0)
            .max("Condition".len());
        let with_group = self.rows.iter().any(|r| r.group_nn.is_some());

        write!(f, "{:<width$}  {:>12}", "Condition", "Batch NN (z)", width = width)?;
        if with_group {
            write!(f, "  {:>14}", "Biology NN (z)")?;
        }
        writeln!(f)?;
        for row in &self.rows {
            write!(f, "{:<width$}  {:>12.3}", row.condition, row.batch_nn, width = width)?;
            if with_group {
                match row.group_nn {
                    Some(g) => write!(f, "  {:>14.3}", g)?,
                    None => write!(f, "  {:>14}", "-")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Z-scored neighbour consistency of several named matrices.
///
/// # Arguments
/// * `conditions` - (name, matrix) pairs, all over the same samples
/// * `batch` - Batch label per sample
/// * `group` - Optional biological group label per sample
/// * `k` - Neighbours per sample
pub fn nn_summary<S: AsRef<str> + Sync>(
    conditions: &[(&str, &DMatrix<f64>)],
    batch: &[S],
    group: Option<&[S]>,
    k: usize,
) -> Result<NnSummary> {
    let rows = conditions
        .iter()
        .map(|(name, x)| {
            let batch_nn = nn_consistency_zscored(x, batch, k)?;
            let group_nn = group
                .map(|g| nn_consistency_zscored(x, g, k))
                .transpose()?;
            Ok(NnRow {
                condition: name.to_string(),
                batch_nn: round3(batch_nn),
                group_nn: group_nn.map(round3),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NnSummary { k, rows })
}
