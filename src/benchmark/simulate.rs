//! Synthetic batch-affected data for benchmarking and testing.
//!
//! Generates feature × sample matrices with known per-batch location/scale
//! distortions and a known biological group signal.

use crate::data::{ExpressionMatrix, Metadata};
use crate::error::{BatchError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for synthetic data generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of features.
    pub n_features: usize,
    /// Number of samples in each batch.
    pub samples_per_batch: Vec<usize>,
    /// Probability of group 1 per batch; the last value is reused for extra batches.
    pub group_probability: Vec<f64>,
    /// Mean shift added to affected features in group-1 samples.
    pub group_shift: f64,
    /// Fraction of features carrying the group signal.
    pub affected_fraction: f64,
    /// Batch b (0-based) is offset by N(loc_step × (b + 1), loc_sd).
    pub loc_step: f64,
    pub loc_sd: f64,
    /// Batch scale is drawn from U(scale_low, scale_high).
    pub scale_low: f64,
    pub scale_high: f64,
    /// Standard deviation of the base noise.
    pub noise_sigma: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_features: 500,
            samples_per_batch: vec![60, 60],
            group_probability: vec![0.5, 0.5],
            group_shift: 0.8,
            affected_fraction: 0.2,
            loc_step: 0.5,
            loc_sd: 0.1,
            scale_low: 0.9,
            scale_high: 1.3,
            noise_sigma: 1.0,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Set dimensions.
    pub fn with_dimensions(mut self, n_features: usize, samples_per_batch: &[usize]) -> Self {
        self.n_features = n_features;
        self.samples_per_batch = samples_per_batch.to_vec();
        self
    }

    /// Set the group-1 probability per batch.
    pub fn with_group_probability(mut self, probabilities: &[f64]) -> Self {
        self.group_probability = probabilities.to_vec();
        self
    }

    /// Set the biological signal size.
    pub fn with_group_shift(mut self, shift: f64) -> Self {
        self.group_shift = shift;
        self
    }

    /// Set the batch scale range.
    pub fn with_scale_range(mut self, low: f64, high: f64) -> Self {
        self.scale_low = low;
        self.scale_high = high;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    // Preset configurations

    /// Two balanced batches with a biological signal on a fifth of features.
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Group membership confounded with batch.
    pub fn confounded() -> Self {
        Self {
            n_features: 600,
            group_probability: vec![0.2, 0.8],
            ..Self::default()
        }
    }

    /// Small, unequal, batch-only data: the setting where shrinkage helps.
    pub fn small_unequal_batches() -> Self {
        Self {
            n_features: 800,
            samples_per_batch: vec![6, 10, 4, 18],
            group_probability: vec![0.5],
            group_shift: 0.0,
            loc_step: 0.4,
            loc_sd: 0.1,
            scale_low: 0.7,
            scale_high: 2.3,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.n_features == 0 || self.samples_per_batch.is_empty() {
            return Err(BatchError::InvalidParameter(
                "Need at least one feature and one batch".to_string(),
            ));
        }
        if self.samples_per_batch.iter().any(|&n| n == 0) {
            return Err(BatchError::InvalidParameter("Empty batch".to_string()));
        }
        if self.group_probability.is_empty()
            || self.group_probability.iter().any(|p| !(0.0..=1.0).contains(p))
        {
            return Err(BatchError::InvalidParameter(
                "Group probabilities must be in [0, 1]".to_string(),
            ));
        }
        if !(self.scale_low > 0.0 && self.scale_high >= self.scale_low) {
            return Err(BatchError::InvalidParameter(format!(
                "Invalid scale range [{}, {}]",
                self.scale_low, self.scale_high
            )));
        }
        if !(0.0..=1.0).contains(&self.affected_fraction) {
            return Err(BatchError::InvalidParameter(format!(
                "affected_fraction must be in [0, 1], got {}",
                self.affected_fraction
            )));
        }
        Ok(())
    }
}

/// Simulated data with its ground truth.
#[derive(Debug, Clone)]
pub struct SimulatedData {
    /// Features × samples values.
    pub matrix: ExpressionMatrix,
    /// Sample metadata with `batch` ("batch_1", ...) and `group` ("0"/"1").
    pub metadata: Metadata,
    /// Feature indices carrying the group signal, ascending.
    pub affected_features: Vec<usize>,
    /// Per-batch (offset, scale) actually applied.
    pub batch_effects: Vec<(f64, f64)>,
    /// Configuration used.
    pub config: SimulationConfig,
}

impl SimulatedData {
    pub fn batch_labels(&self) -> Vec<String> {
        self.labels("batch")
    }

    pub fn group_labels(&self) -> Vec<String> {
        self.labels("group")
    }

    fn labels(&self, column: &str) -> Vec<String> {
        self.matrix
            .sample_ids()
            .iter()
            .map(|sid| {
                self.metadata
                    .get(sid, column)
                    .and_then(|v| v.as_label())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Write `matrix.tsv` and `metadata.tsv` to a directory.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.matrix.to_tsv(dir.join("matrix.tsv"))?;
        std::fs::write(dir.join("metadata.tsv"), self.metadata_to_tsv())?;
        Ok(())
    }

    fn metadata_to_tsv(&self) -> String {
        let mut out = String::from("sample_id\tbatch\tgroup\n");
        for ((sid, batch), group) in self
            .matrix
            .sample_ids()
            .iter()
            .zip(self.batch_labels())
            .zip(self.group_labels())
        {
            out.push_str(&format!("{}\t{}\t{}\n", sid, batch, group));
        }
        out
    }
}

/// Simple xorshift random number generator for reproducibility.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64)
    }

    fn next_uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Normal draw via Box-Muller.
    fn next_normal(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-10);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std * z
    }

    fn shuffle<T>(&mut self, vec: &mut [T]) {
        for i in (1..vec.len()).rev() {
            let j = (self.next_u64() as usize) % (i + 1);
            vec.swap(i, j);
        }
    }
}

/// Generate batch-affected data with known ground truth.
pub fn simulate(config: &SimulationConfig) -> Result<SimulatedData> {
    config.validate()?;
    let mut rng = Rng::new(config.seed);

    let n_features = config.n_features;
    let n_total: usize = config.samples_per_batch.iter().sum();

    let mut data = DMatrix::from_fn(n_features, n_total, |_, _| {
        rng.next_normal(0.0, config.noise_sigma)
    });

    let mut batch_labels = Vec::with_capacity(n_total);
    let mut groups = Vec::with_capacity(n_total);
    let mut batch_effects = Vec::with_capacity(config.samples_per_batch.len());

    let mut start = 0;
    for (b, &n) in config.samples_per_batch.iter().enumerate() {
        let p = config
            .group_probability
            .get(b)
            .or(config.group_probability.last())
            .copied()
            .unwrap_or(0.5);
        for _ in 0..n {
            groups.push(u8::from(rng.next_f64() < p));
        }

        let loc = rng.next_normal(config.loc_step * (b + 1) as f64, config.loc_sd);
        let scale = rng.next_uniform(config.scale_low, config.scale_high);
        for j in start..start + n {
            for i in 0..n_features {
                data[(i, j)] = (data[(i, j)] + loc) * scale;
            }
        }
        batch_effects.push((loc, scale));
        batch_labels.extend(std::iter::repeat(format!("batch_{}", b + 1)).take(n));
        start += n;
    }

    // Biological signal
    let n_affected = (n_features as f64 * config.affected_fraction) as usize;
    let mut features: Vec<usize> = (0..n_features).collect();
    rng.shuffle(&mut features);
    let mut affected_features: Vec<usize> = features.into_iter().take(n_affected).collect();
    affected_features.sort_unstable();

    for &i in &affected_features {
        for (j, &g) in groups.iter().enumerate() {
            if g == 1 {
                data[(i, j)] += config.group_shift;
            }
        }
    }

    let feature_ids: Vec<String> = (0..n_features).map(|i| format!("F{}", i + 1)).collect();
    let sample_ids: Vec<String> = (0..n_total).map(|j| format!("S{}", j + 1)).collect();

    let mut metadata = Metadata::new(sample_ids.clone());
    metadata.insert_categorical("batch", &batch_labels)?;
    let group_labels: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
    metadata.insert_categorical("group", &group_labels)?;

    log::debug!(
        "simulated {} features × {} samples in {} batches ({} affected)",
        n_features,
        n_total,
        config.samples_per_batch.len(),
        n_affected
    );

    Ok(SimulatedData {
        matrix: ExpressionMatrix::new(data, feature_ids, sample_ids)?,
        metadata,
        affected_features,
        batch_effects,
        config: config.clone(),
    })
}
