//! Integration tests for batch alignment and ComBat correction.

use approx::assert_relative_eq;
use composable_batch::prelude::*;
use composable_batch::stats::mean;
use nalgebra::DMatrix;
use std::io::Write;
use tempfile::NamedTempFile;

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i + 1)).collect()
}

fn batch_labels(data: &SimulatedData) -> BatchLabels {
    BatchLabels::from_metadata(&data.metadata, "batch", data.matrix.sample_ids()).unwrap()
}

fn group_design(data: &SimulatedData) -> DesignMatrix {
    DesignMatrix::from_formula(
        &data.metadata,
        &Formula::parse("~ group").unwrap(),
        data.matrix.sample_ids(),
    )
    .unwrap()
}

#[test]
fn test_shape_and_ids_preserved() {
    let data = simulate(&SimulationConfig::default().with_dimensions(40, &[10, 14])).unwrap();
    let batches = batch_labels(&data);

    for c in [
        batch_align(&data.matrix, &batches, None, &AlignOptions::default()).unwrap(),
        combat(&data.matrix, &batches, None, &AlignOptions::default(), &EbConfig::default())
            .unwrap(),
    ] {
        assert_eq!(c.matrix.n_features(), 40);
        assert_eq!(c.matrix.n_samples(), 24);
        assert_eq!(c.matrix.feature_ids(), data.matrix.feature_ids());
        assert_eq!(c.matrix.sample_ids(), data.matrix.sample_ids());
        assert!(c.corrected().iter().all(|v| v.is_finite()));
    }
}

#[test]
fn test_intercept_only_design_matches_no_design() {
    let data = simulate(&SimulationConfig::default().with_dimensions(30, &[8, 8, 6])).unwrap();
    let batches = batch_labels(&data);
    let intercept = DesignMatrix::intercept_only(data.matrix.sample_ids().to_vec());
    let opts = AlignOptions::default();

    let a = batch_align(&data.matrix, &batches, None, &opts).unwrap();
    let b = batch_align(&data.matrix, &batches, Some(&intercept), &opts).unwrap();
    for (x, y) in a.corrected().iter().zip(b.corrected().iter()) {
        assert_relative_eq!(*x, *y, epsilon = 1e-9);
    }

    let eb = EbConfig::default();
    let a = combat(&data.matrix, &batches, None, &opts, &eb).unwrap();
    let b = combat(&data.matrix, &batches, Some(&intercept), &opts, &eb).unwrap();
    for (x, y) in a.corrected().iter().zip(b.corrected().iter()) {
        assert_relative_eq!(*x, *y, epsilon = 1e-9);
    }
}

#[test]
fn test_within_batch_permutation_is_equivariant() {
    let data = simulate(&SimulationConfig::default().with_dimensions(25, &[6, 6])).unwrap();
    let design = group_design(&data);
    let opts = AlignOptions::default();

    // Reverse the columns of each batch
    let order: Vec<usize> = (0..6).rev().chain((6..12).rev()).collect();
    let permuted = data.matrix.subset_samples(&order).unwrap();
    let permuted_batches =
        BatchLabels::from_metadata(&data.metadata, "batch", permuted.sample_ids()).unwrap();

    let a = batch_align(&data.matrix, &batch_labels(&data), Some(&design), &opts).unwrap();
    let b = batch_align(&permuted, &permuted_batches, Some(&design), &opts).unwrap();

    for (new_col, &old_col) in order.iter().enumerate() {
        for i in 0..data.matrix.n_features() {
            assert_relative_eq!(
                a.corrected()[(i, old_col)],
                b.corrected()[(i, new_col)],
                epsilon = 1e-9
            );
        }
    }
}

#[test]
fn test_permuting_one_batch_leaves_other_batch_unchanged() {
    let data = simulate(&SimulationConfig::default().with_dimensions(25, &[6, 6])).unwrap();
    let design = group_design(&data);
    let opts = AlignOptions::default();
    let eb = EbConfig::default();

    // Shuffle batch_1 (columns 0..6) only
    let order: Vec<usize> = vec![4, 0, 5, 2, 1, 3, 6, 7, 8, 9, 10, 11];
    let permuted = data.matrix.subset_samples(&order).unwrap();
    let permuted_batches =
        BatchLabels::from_metadata(&data.metadata, "batch", permuted.sample_ids()).unwrap();
    let batches = batch_labels(&data);

    let pairs = [
        (
            batch_align(&data.matrix, &batches, Some(&design), &opts).unwrap(),
            batch_align(&permuted, &permuted_batches, Some(&design), &opts).unwrap(),
        ),
        (
            combat(&data.matrix, &batches, Some(&design), &opts, &eb).unwrap(),
            combat(&permuted, &permuted_batches, Some(&design), &opts, &eb).unwrap(),
        ),
    ];

    for (a, b) in &pairs {
        // batch_2 keeps its positions and values
        for j in 6..12 {
            for i in 0..data.matrix.n_features() {
                assert_relative_eq!(a.corrected()[(i, j)], b.corrected()[(i, j)], epsilon = 1e-9);
            }
        }
        // batch_1 values move with their samples
        for (new_col, &old_col) in order.iter().enumerate().take(6) {
            for i in 0..data.matrix.n_features() {
                assert_relative_eq!(
                    a.corrected()[(i, old_col)],
                    b.corrected()[(i, new_col)],
                    epsilon = 1e-9
                );
            }
        }
    }
}

#[test]
fn test_constant_feature_stays_constant() {
    let mut rows: Vec<Vec<f64>> = vec![vec![5.0; 8]];
    rows.push(vec![1.0, 2.0, 1.5, 2.5, 4.0, 5.0, 4.5, 5.5]);
    let matrix = ExpressionMatrix::from_rows(&rows, ids("F", 2), ids("S", 8)).unwrap();
    let batches = BatchLabels::new(&["a", "a", "a", "a", "b", "b", "b", "b"]).unwrap();
    let opts = AlignOptions::default();

    let aligned = batch_align(&matrix, &batches, None, &opts).unwrap();
    assert!(aligned.corrected().row(0).iter().all(|&v| v == 5.0));

    let shrunk = combat(&matrix, &batches, None, &opts, &EbConfig::default()).unwrap();
    for &v in shrunk.corrected().row(0).iter() {
        assert_relative_eq!(v, 5.0, epsilon = 1e-6);
    }
}

#[test]
fn test_shifted_batch_residual_means_vanish() {
    // Batch b carries a +3 offset on every feature
    let base = [0.3, -0.2, 0.5, -0.6, 0.1, 0.4, -0.5, 0.0];
    let rows: Vec<Vec<f64>> = (0..3)
        .map(|f| {
            base.iter()
                .enumerate()
                .map(|(j, v)| v * (f + 1) as f64 + if j >= 4 { 3.0 } else { 0.0 })
                .collect()
        })
        .collect();
    let matrix = ExpressionMatrix::from_rows(&rows, ids("F", 3), ids("S", 8)).unwrap();
    let batches = BatchLabels::new(&["a", "a", "a", "a", "b", "b", "b", "b"]).unwrap();

    let c = batch_align(&matrix, &batches, None, &AlignOptions::default()).unwrap();
    let z = standardize_features(c.corrected()).unwrap();
    let fit = fit_design(&z.data, None).unwrap();
    let after = estimate_batch_moments(&fit.residuals, &batches).unwrap();
    for v in after.means.iter() {
        assert!(v.abs() < 1e-9);
    }
}

#[test]
fn test_collinear_design_still_corrects() {
    let data = simulate(&SimulationConfig::default().with_dimensions(20, &[6, 6])).unwrap();
    let batches = batch_labels(&data);
    // Design that duplicates the batch indicator
    let indicator: Vec<f64> = batches.codes().iter().map(|&c| c as f64).collect();
    let x = DMatrix::from_fn(12, 3, |i, j| match j {
        0 => 1.0,
        _ => indicator[i],
    });
    let design = DesignMatrix::from_matrix(
        x,
        vec!["(Intercept)".into(), "b1".into(), "b2".into()],
        data.matrix.sample_ids().to_vec(),
    )
    .unwrap();

    let c = batch_align(&data.matrix, &batches, Some(&design), &AlignOptions::default()).unwrap();
    assert_eq!(c.design.rank, 2);
    assert!(c.design.coefficients.iter().all(|v| v.is_finite()));
    assert!(c.corrected().iter().all(|v| v.is_finite()));
}

#[test]
fn test_combat_estimates_lie_between_raw_and_prior() {
    let data = simulate(&SimulationConfig::small_unequal_batches()).unwrap();
    let batches = batch_labels(&data);
    let c = combat(
        &data.matrix,
        &batches,
        None,
        &AlignOptions::default(),
        &EbConfig::default(),
    )
    .unwrap();

    let shrunk = c.shrunk.as_ref().unwrap();
    for (b, prior) in shrunk.priors.iter().enumerate() {
        assert_eq!(prior.n_samples, batches.indices(b).len());
        for i in 0..c.moments.n_features() {
            let raw = c.moments.means[(i, b)];
            let post = shrunk.gamma_star[(i, b)];
            assert!((post - prior.gamma_bar).abs() <= (raw - prior.gamma_bar).abs() + 1e-6);
            let w = shrunk.mean_weights[(i, b)];
            assert!(w > 0.0 && w < 1.0);
        }
    }
    assert!(shrunk
        .delta_star
        .iter()
        .all(|&d| (1e-3..=1e3).contains(&d)));
    assert!(c.summary().batches.iter().all(|b| b.prior.is_some()));
}

#[test]
fn test_correction_improves_batch_mixing() {
    let config = SimulationConfig {
        loc_step: 1.5,
        ..SimulationConfig::default()
    }
    .with_dimensions(300, &[30, 30])
    .with_group_shift(3.0);
    let data = simulate(&config).unwrap();
    let batches = batch_labels(&data);
    let design = group_design(&data);

    let aligned =
        batch_align(&data.matrix, &batches, Some(&design), &AlignOptions::default()).unwrap();
    let batch = data.batch_labels();
    let group = data.group_labels();
    let summary = nn_summary(
        &[("Before", data.matrix.data()), ("With design", aligned.corrected())],
        batch.as_slice(),
        Some(group.as_slice()),
        5,
    )
    .unwrap();

    let before = summary.get("Before").unwrap();
    let after = summary.get("With design").unwrap();
    assert!(after.batch_nn < before.batch_nn);
    assert!(after.group_nn.unwrap() > 0.75);

    let pca_after = pca(aligned.corrected(), 2).unwrap();
    assert!(pca_after.variance_explained(2) <= 1.0);
}

#[test]
fn test_pipeline_from_yaml_file() {
    let data = simulate(&SimulationConfig::default().with_dimensions(20, &[5, 7])).unwrap();

    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "name: combat-with-group
description: ComBat keeping the group effect
steps:
  - Standardize
  - RegressDesign:
      formula: \"~ group\"
  - ShrinkComBat:
      batch_column: batch
      config:
        shape_convention: ResidualDf
  - Reconstruct"
    )
    .unwrap();
    file.flush().unwrap();

    let config = PipelineConfig::from_yaml_file(file.path()).unwrap();
    let from_yaml = Pipeline::from_config(&config)
        .run(&data.matrix, &data.metadata)
        .unwrap();

    let direct = combat(
        &data.matrix,
        &batch_labels(&data),
        Some(&group_design(&data)),
        &AlignOptions::default(),
        &EbConfig::default().with_shape_convention(ShapeConvention::ResidualDf),
    )
    .unwrap();

    for (x, y) in from_yaml.corrected().iter().zip(direct.corrected().iter()) {
        assert_relative_eq!(*x, *y, epsilon = 1e-10);
    }
    assert_eq!(from_yaml.summary().method, CorrectionMethod::ComBat);
}

#[test]
fn test_tsv_round_trip_through_correction() {
    let data = simulate(&SimulationConfig::default().with_dimensions(10, &[4, 4])).unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    data.write_to_dir(dir.path()).unwrap();

    let matrix = ExpressionMatrix::from_tsv(dir.path().join("matrix.tsv")).unwrap();
    let metadata = Metadata::from_tsv(dir.path().join("metadata.tsv")).unwrap();
    let c = run_batch_align(&matrix, &metadata, "batch", None).unwrap();

    let out = dir.path().join("corrected.tsv");
    c.matrix.to_tsv(&out).unwrap();
    let back = ExpressionMatrix::from_tsv(&out).unwrap();
    assert_eq!(back.sample_ids(), matrix.sample_ids());

    // Feature means survive correction without a design
    for i in 0..matrix.n_features() {
        assert_relative_eq!(mean(&matrix.row(i)), mean(&back.row(i)), epsilon = 1e-6);
    }
}
