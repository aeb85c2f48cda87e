//! Dense expression matrix (features × samples).

use crate::error::{BatchError, Result};
use nalgebra::DMatrix;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A dense matrix of feature measurements across samples.
///
/// Rows represent features (genes, proteins, ...), columns represent samples.
/// Every entry is guaranteed finite; missing values are not supported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionMatrix {
    /// Values (features × samples).
    data: DMatrix<f64>,
    /// Feature identifiers (row names).
    feature_ids: Vec<String>,
    /// Sample identifiers (column names).
    sample_ids: Vec<String>,
}

impl ExpressionMatrix {
    /// Create a new ExpressionMatrix, validating shape and finiteness.
    pub fn new(
        data: DMatrix<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        let (nrows, ncols) = data.shape();
        if nrows == 0 || ncols == 0 {
            return Err(BatchError::EmptyData(format!(
                "Expression matrix must be non-empty (got {} × {})",
                nrows, ncols
            )));
        }
        if nrows != feature_ids.len() {
            return Err(BatchError::DimensionMismatch {
                expected: nrows,
                actual: feature_ids.len(),
            });
        }
        if ncols != sample_ids.len() {
            return Err(BatchError::DimensionMismatch {
                expected: ncols,
                actual: sample_ids.len(),
            });
        }
        ensure_finite(&data)?;

        Ok(Self {
            data,
            feature_ids,
            sample_ids,
        })
    }

    /// Build from row vectors (one per feature).
    pub fn from_rows(
        rows: &[Vec<f64>],
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        let n_samples = sample_ids.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != n_samples) {
            return Err(BatchError::DimensionMismatch {
                expected: n_samples,
                actual: bad.len(),
            });
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let data = DMatrix::from_row_slice(rows.len(), n_samples, &flat);
        Self::new(data, feature_ids, sample_ids)
    }

    /// Load an expression matrix from a TSV file.
    ///
    /// Expected format:
    /// - First row: header with sample IDs (first column is the feature ID header)
    /// - Subsequent rows: feature ID followed by one value per sample
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| BatchError::EmptyData("Empty TSV file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(BatchError::EmptyData(
                "TSV must have at least one sample".to_string(),
            ));
        }
        let sample_ids: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();
        let n_samples = sample_ids.len();

        let mut feature_ids = Vec::new();
        let mut values: Vec<f64> = Vec::new();

        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let row = feature_ids.len();
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != n_samples + 1 {
                return Err(BatchError::DimensionMismatch {
                    expected: n_samples + 1,
                    actual: fields.len(),
                });
            }
            feature_ids.push(fields[0].trim().to_string());
            for (col, raw) in fields[1..].iter().enumerate() {
                let value: f64 = raw.trim().parse().map_err(|_| BatchError::InvalidValue {
                    value: raw.to_string(),
                    row,
                    col,
                })?;
                values.push(value);
            }
        }

        if feature_ids.is_empty() {
            return Err(BatchError::EmptyData("No features in TSV".to_string()));
        }

        let data = DMatrix::from_row_slice(feature_ids.len(), n_samples, &values);
        Self::new(data, feature_ids, sample_ids)
    }

    /// Write the matrix to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write!(writer, "feature_id")?;
        for sample_id in &self.sample_ids {
            write!(writer, "\t{}", sample_id)?;
        }
        writeln!(writer)?;

        for (i, feature_id) in self.feature_ids.iter().enumerate() {
            write!(writer, "{}", feature_id)?;
            for j in 0..self.n_samples() {
                write!(writer, "\t{}", self.data[(i, j)])?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Value at (feature, sample).
    #[inline]
    pub fn get(&self, feature: usize, sample: usize) -> f64 {
        self.data[(feature, sample)]
    }

    /// Number of features (rows).
    #[inline]
    pub fn n_features(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples (columns).
    #[inline]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Feature identifiers.
    #[inline]
    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    /// Sample identifiers.
    #[inline]
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Underlying dense matrix.
    #[inline]
    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Consume and return the underlying matrix.
    pub fn into_data(self) -> DMatrix<f64> {
        self.data
    }

    /// A feature's values across samples.
    pub fn row(&self, feature: usize) -> Vec<f64> {
        self.data.row(feature).iter().copied().collect()
    }

    /// Index of a sample by ID.
    pub fn sample_index(&self, sample_id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == sample_id)
    }

    /// Replace the values, keeping identifiers. Shape must match.
    pub fn with_data(&self, data: DMatrix<f64>) -> Result<Self> {
        if data.shape() != self.data.shape() {
            return Err(BatchError::DimensionMismatch {
                expected: self.n_features() * self.n_samples(),
                actual: data.nrows() * data.ncols(),
            });
        }
        Self::new(data, self.feature_ids.clone(), self.sample_ids.clone())
    }

    /// Subset (and reorder) to the given sample column indices.
    pub fn subset_samples(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&j| j >= self.n_samples()) {
            return Err(BatchError::InvalidParameter(format!(
                "Sample index {} out of bounds",
                bad
            )));
        }
        let data = self.data.select_columns(indices);
        let sample_ids = indices.iter().map(|&j| self.sample_ids[j].clone()).collect();
        Self::new(data, self.feature_ids.clone(), sample_ids)
    }

    /// Reorder columns to follow `sample_ids`.
    pub fn select_samples(&self, sample_ids: &[String]) -> Result<Self> {
        let indices = sample_ids
            .iter()
            .map(|sid| {
                self.sample_index(sid).ok_or_else(|| {
                    BatchError::SampleMismatch(format!("Sample '{}' not found in matrix", sid))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.subset_samples(&indices)
    }
}

/// Reject NaN and infinite entries.
pub(crate) fn ensure_finite(data: &DMatrix<f64>) -> Result<()> {
    for j in 0..data.ncols() {
        for i in 0..data.nrows() {
            if !data[(i, j)].is_finite() {
                return Err(BatchError::NonFinite {
                    feature: i,
                    sample: j,
                });
            }
        }
    }
    Ok(())
}
