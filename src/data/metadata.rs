//! Per-sample annotations (batch labels, biological covariates).

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A single annotation value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical level.
    Categorical(String),
    /// Numeric value.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Render as a label, whatever the storage type.
    pub fn as_label(&self) -> Option<String> {
        match self {
            Variable::Categorical(s) => Some(s.clone()),
            Variable::Continuous(v) => Some(v.to_string()),
            Variable::Missing => None,
        }
    }
}

/// Column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Sample annotation table, stored column-wise.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    sample_ids: Vec<String>,
    column_names: Vec<String>,
    columns: HashMap<String, Vec<Variable>>,
    column_types: HashMap<String, VariableType>,
}

fn is_missing_token(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("na") || raw.eq_ignore_ascii_case("nan")
}

impl Metadata {
    /// Empty metadata for the given samples.
    pub fn new(sample_ids: Vec<String>) -> Self {
        Self {
            sample_ids,
            ..Default::default()
        }
    }

    /// Load metadata from a TSV file.
    ///
    /// The first column holds sample IDs. A column whose non-missing values
    /// all parse as numbers is continuous; anything else is categorical.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        let header_line = lines
            .next()
            .ok_or_else(|| BatchError::EmptyData("Empty metadata file".to_string()))??;
        let header: Vec<String> = header_line.split('\t').map(|s| s.trim().to_string()).collect();
        if header.len() < 2 {
            return Err(BatchError::EmptyData(
                "Metadata must have at least one variable column".to_string(),
            ));
        }

        let mut sample_ids = Vec::new();
        let mut raw_columns: Vec<Vec<String>> = vec![Vec::new(); header.len() - 1];
        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            sample_ids.push(fields[0].trim().to_string());
            for (c, column) in raw_columns.iter_mut().enumerate() {
                column.push(fields.get(c + 1).map(|s| s.trim()).unwrap_or("").to_string());
            }
        }
        if sample_ids.is_empty() {
            return Err(BatchError::EmptyData("No samples in metadata".to_string()));
        }

        let mut metadata = Self::new(sample_ids);
        for (name, raw) in header[1..].iter().zip(raw_columns) {
            let numeric = raw
                .iter()
                .all(|v| is_missing_token(v) || v.parse::<f64>().is_ok());
            let values: Vec<Variable> = raw
                .into_iter()
                .map(|v| {
                    if is_missing_token(&v) {
                        Variable::Missing
                    } else if numeric {
                        v.parse::<f64>().map(Variable::Continuous).unwrap_or(Variable::Missing)
                    } else {
                        Variable::Categorical(v)
                    }
                })
                .collect();
            let var_type = if numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            metadata.insert_column(name, values, var_type)?;
        }
        Ok(metadata)
    }

    /// Add or replace a column. One value per sample is required.
    pub fn insert_column(
        &mut self,
        name: &str,
        values: Vec<Variable>,
        var_type: VariableType,
    ) -> Result<()> {
        if values.len() != self.sample_ids.len() {
            return Err(BatchError::DimensionMismatch {
                expected: self.sample_ids.len(),
                actual: values.len(),
            });
        }
        if !self.columns.contains_key(name) {
            self.column_names.push(name.to_string());
        }
        self.columns.insert(name.to_string(), values);
        self.column_types.insert(name.to_string(), var_type);
        Ok(())
    }

    /// Add a categorical column from string labels.
    pub fn insert_categorical<S: AsRef<str>>(&mut self, name: &str, labels: &[S]) -> Result<()> {
        let values = labels
            .iter()
            .map(|l| Variable::Categorical(l.as_ref().to_string()))
            .collect();
        self.insert_column(name, values, VariableType::Categorical)
    }

    /// Add a continuous column.
    pub fn insert_continuous(&mut self, name: &str, values: &[f64]) -> Result<()> {
        let values = values.iter().map(|&v| Variable::Continuous(v)).collect();
        self.insert_column(name, values, VariableType::Continuous)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// All values of a column in sample order.
    pub fn column(&self, column: &str) -> Result<&[Variable]> {
        self.columns
            .get(column)
            .map(|v| v.as_slice())
            .ok_or_else(|| BatchError::MissingColumn(column.to_string()))
    }

    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Value for one sample.
    pub fn get(&self, sample_id: &str, column: &str) -> Option<&Variable> {
        let idx = self.sample_ids.iter().position(|s| s == sample_id)?;
        self.columns.get(column).and_then(|c| c.get(idx))
    }

    /// Sorted distinct levels of a column (missing values excluded).
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let levels: BTreeSet<String> = self
            .column(column)?
            .iter()
            .filter_map(Variable::as_label)
            .collect();
        Ok(levels.into_iter().collect())
    }

    /// Reorder/subset rows to follow `sample_ids`.
    pub fn align_to(&self, sample_ids: &[String]) -> Result<Self> {
        let lookup: HashMap<&str, usize> = self
            .sample_ids
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let order = sample_ids
            .iter()
            .map(|sid| {
                lookup.get(sid.as_str()).copied().ok_or_else(|| {
                    BatchError::SampleMismatch(format!("Sample '{}' not found in metadata", sid))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let reordered = order.iter().map(|&i| values[i].clone()).collect();
                (name.clone(), reordered)
            })
            .collect();

        Ok(Self {
            sample_ids: sample_ids.to_vec(),
            column_names: self.column_names.clone(),
            columns,
            column_types: self.column_types.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_tsv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample_id\tbatch\tgroup\tage").unwrap();
        writeln!(file, "S1\trun2\tcase\t25").unwrap();
        writeln!(file, "S2\trun1\tcontrol\t30").unwrap();
        writeln!(file, "S3\trun2\tcontrol\tNA").unwrap();
        writeln!(file, "S4\trun1\tcase\t28").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_and_infer_types() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();

        assert_eq!(meta.n_samples(), 4);
        assert_eq!(meta.column_names(), &["batch", "group", "age"]);
        assert_eq!(meta.column_type("batch"), Some(VariableType::Categorical));
        assert_eq!(meta.column_type("age"), Some(VariableType::Continuous));
        assert_eq!(meta.get("S2", "age").unwrap().as_continuous(), Some(30.0));
        assert!(meta.get("S3", "age").unwrap().is_missing());
    }

    #[test]
    fn test_levels_sorted() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();
        assert_eq!(meta.levels("batch").unwrap(), vec!["run1", "run2"]);
        assert!(meta.levels("nope").is_err());
    }

    #[test]
    fn test_align_to() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();
        let order: Vec<String> = vec!["S4".into(), "S1".into()];
        let aligned = meta.align_to(&order).unwrap();

        assert_eq!(aligned.sample_ids(), &["S4", "S1"]);
        assert_eq!(aligned.column("group").unwrap()[0].as_categorical(), Some("case"));
        assert_eq!(aligned.column("age").unwrap()[1].as_continuous(), Some(25.0));

        assert!(meta.align_to(&["S9".to_string()]).is_err());
    }

    #[test]
    fn test_insert_column_length_checked() {
        let mut meta = Metadata::new(vec!["a".into(), "b".into()]);
        assert!(meta.insert_categorical("batch", &["x"]).is_err());
        meta.insert_categorical("batch", &["x", "y"]).unwrap();
        meta.insert_continuous("dose", &[1.0, 2.0]).unwrap();
        assert_eq!(meta.column_names(), &["batch", "dose"]);
    }
}
