use std::collections::BTreeSet;

use anyhow::{ensure, Result};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::explore::{CorrelatedPair, CorrelationMatrix};

#[derive(Debug, Clone)]
pub struct FeatureScaling {
    pub feature: String,
    pub mean: f64,
    pub std_dev: f64,
}

/// Outcome of the correlation filter.
#[derive(Debug, Clone)]
pub struct FeatureSelection {
    pub threshold: f64,
    pub retained: Vec<String>,
    pub dropped: Vec<String>,
    /// Every feature that takes part in at least one pair above the threshold.
    pub candidates: Vec<String>,
    /// Retained pairs still above the threshold (only possible with an override).
    pub violations: Vec<CorrelatedPair>,
    pub overridden: bool,
}

/// Disjoint, sorted row indices for the training and held-out partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Drop features until no retained pair has |r| above `threshold`.
///
/// With a non-empty `retain` list the retained set is exactly that list and
/// offending pairs are reported instead of resolved. Otherwise pairs are
/// visited strongest first and, while both members survive, the member with
/// the larger mean absolute correlation to all other features is dropped
/// (the later column on ties).
pub fn reduce_features(
    matrix: &CorrelationMatrix,
    threshold: f64,
    retain: &[String],
) -> Result<FeatureSelection> {
    ensure!(
        threshold > 0.0 && threshold <= 1.0,
        "correlation threshold must lie in (0, 1], got {}",
        threshold
    );

    let pairs = matrix.pairs_above(threshold);
    let flagged: BTreeSet<&str> = pairs
        .iter()
        .flat_map(|p| [p.first.as_str(), p.second.as_str()])
        .collect();
    let candidates: Vec<String> = matrix
        .names
        .iter()
        .filter(|n| flagged.contains(n.as_str()))
        .cloned()
        .collect();

    let keep: Vec<bool> = if retain.is_empty() {
        greedy_filter(matrix, &pairs)
    } else {
        for name in retain {
            ensure!(
                matrix.index_of(name).is_some(),
                "retained feature '{}' is not a feature column of the dataset",
                name
            );
        }
        matrix.names.iter().map(|n| retain.contains(n)).collect()
    };

    let retained: Vec<String> = matrix
        .names
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(n, _)| n.clone())
        .collect();
    let dropped: Vec<String> = matrix
        .names
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| !k)
        .map(|(n, _)| n.clone())
        .collect();
    ensure!(!retained.is_empty(), "feature reduction retained no features");

    let violations = matrix
        .restrict(&retained)
        .map(|sub| sub.pairs_above(threshold))
        .unwrap_or_default();
    for pair in &violations {
        log::warn!(
            "retained features '{}' and '{}' correlate at r = {:.3}, above the {} threshold",
            pair.first,
            pair.second,
            pair.r,
            threshold
        );
    }

    log::info!(
        "Feature reduction at |r| > {}: kept {} of {} features",
        threshold,
        retained.len(),
        matrix.len()
    );

    Ok(FeatureSelection {
        threshold,
        retained,
        dropped,
        candidates,
        violations,
        overridden: !retain.is_empty(),
    })
}

fn greedy_filter(matrix: &CorrelationMatrix, pairs: &[CorrelatedPair]) -> Vec<bool> {
    let p = matrix.len();
    let mean_abs: Vec<f64> = (0..p)
        .map(|i| {
            if p < 2 {
                return 0.0;
            }
            let total: f64 = (0..p)
                .filter(|&j| j != i)
                .map(|j| matrix.values[(i, j)].abs())
                .sum();
            total / (p - 1) as f64
        })
        .collect();

    let mut keep = vec![true; p];
    for pair in pairs {
        let (Some(a), Some(b)) = (matrix.index_of(&pair.first), matrix.index_of(&pair.second))
        else {
            continue;
        };
        if !(keep[a] && keep[b]) {
            continue;
        }
        let (earlier, later) = if a < b { (a, b) } else { (b, a) };
        let victim = if mean_abs[earlier] > mean_abs[later] {
            earlier
        } else {
            later
        };
        log::debug!(
            "dropping '{}' (|r| = {:.3} between '{}' and '{}')",
            matrix.names[victim],
            pair.r.abs(),
            pair.first,
            pair.second
        );
        keep[victim] = false;
    }
    keep
}

pub(crate) fn compute_feature_scaling(
    data: &DMatrix<f64>,
    feature_names: &[String],
) -> Result<Vec<FeatureScaling>> {
    let row_count = data.nrows();
    ensure!(row_count > 1, "at least two rows are needed to standardize features");
    ensure!(
        data.ncols() == feature_names.len(),
        "scaling input has {} columns but {} names",
        data.ncols(),
        feature_names.len()
    );

    let mut stats = Vec::with_capacity(feature_names.len());

    for (j, name) in feature_names.iter().enumerate() {
        let column = data.column(j);
        let mean = column.sum() / row_count as f64;

        let mut variance_sum = 0.0;
        for value in column.iter() {
            let diff = value - mean;
            variance_sum += diff * diff;
        }

        let std_dev = (variance_sum / (row_count - 1) as f64).sqrt();
        ensure!(
            std_dev.is_finite() && std_dev > 0.0,
            "feature '{}' has zero variance across dataset",
            name
        );

        stats.push(FeatureScaling {
            feature: name.clone(),
            mean,
            std_dev,
        });
    }

    Ok(stats)
}

pub(crate) fn apply_scaling(mut data: DMatrix<f64>, scaling: &[FeatureScaling]) -> DMatrix<f64> {
    for (j, stat) in scaling.iter().enumerate() {
        for value in data.column_mut(j).iter_mut() {
            *value = (*value - stat.mean) / stat.std_dev;
        }
    }
    data
}

/// Stratified split: within each class the row indices are shuffled by a
/// seeded `StdRng` and the first `ceil(n_class * fraction)` go to training.
pub fn stratified_split(response: &[u8], fraction: f64, seed: u64) -> Result<Partition> {
    ensure!(
        fraction > 0.0 && fraction < 1.0,
        "split fraction must lie strictly between 0 and 1, got {}",
        fraction
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in [0u8, 1u8] {
        let mut rows: Vec<usize> = response
            .iter()
            .enumerate()
            .filter(|(_, &y)| y == class)
            .map(|(idx, _)| idx)
            .collect();
        rows.shuffle(&mut rng);

        let take = ((rows.len() as f64 * fraction) - 1e-9).ceil().max(0.0) as usize;
        let take = take.min(rows.len());
        train.extend_from_slice(&rows[..take]);
        test.extend_from_slice(&rows[take..]);
    }

    train.sort_unstable();
    test.sort_unstable();

    ensure!(!train.is_empty(), "training partition is empty");
    ensure!(
        !test.is_empty(),
        "held-out partition is empty; lower the split fraction or add rows"
    );

    log::info!(
        "Stratified split (seed {}, fraction {}): {} train / {} test",
        seed,
        fraction,
        train.len(),
        test.len()
    );

    Ok(Partition { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::correlation_matrix;
    use approx::assert_abs_diff_eq;
    use rand::Rng;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("f{}", i)).collect()
    }

    // Columns built from a few shared latent factors so that some pairs are
    // strongly correlated and others are not.
    fn latent_features(seed: u64, rows: usize, cols: usize) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let factors: Vec<Vec<f64>> = (0..3)
            .map(|_| (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        let mut data = DMatrix::zeros(rows, cols);
        for j in 0..cols {
            let factor = &factors[j % 3];
            let noise = rng.gen_range(0.05..1.5);
            for i in 0..rows {
                data[(i, j)] = factor[i] + noise * rng.gen_range(-1.0..1.0);
            }
        }
        data
    }

    #[test]
    fn greedy_filter_leaves_no_pair_above_threshold() {
        for seed in 0..20 {
            let cols = 4 + (seed as usize % 6);
            let features = latent_features(seed, 60, cols);
            let matrix = correlation_matrix(&features, &names(cols)).expect("corr");

            for threshold in [0.3, 0.6, 0.9] {
                let selection = reduce_features(&matrix, threshold, &[]).expect("reduce");
                let sub = matrix.restrict(&selection.retained).expect("restrict");
                assert!(sub.pairs_above(threshold).is_empty());
                assert!(selection.violations.is_empty());
                assert_eq!(selection.retained.len() + selection.dropped.len(), cols);
                for dropped in &selection.dropped {
                    assert!(selection.candidates.contains(dropped));
                }
            }
        }
    }

    #[test]
    fn greedy_filter_drops_the_more_entangled_member() {
        let values = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.9, 0.7, 0.9, 1.0, 0.2, 0.7, 0.2, 1.0],
        );
        let matrix = CorrelationMatrix {
            names: names(3),
            values,
        };
        let selection = reduce_features(&matrix, 0.6, &[]).expect("reduce");
        assert_eq!(selection.dropped, vec!["f0".to_string()]);
        assert_eq!(selection.retained, vec!["f1".to_string(), "f2".to_string()]);
        assert_eq!(selection.candidates.len(), 3);
    }

    #[test]
    fn override_keeps_exact_list_and_reports_violations() {
        let values = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.9, 0.1, 0.9, 1.0, 0.2, 0.1, 0.2, 1.0],
        );
        let matrix = CorrelationMatrix {
            names: names(3),
            values,
        };
        let retain = vec!["f1".to_string(), "f0".to_string()];
        let selection = reduce_features(&matrix, 0.6, &retain).expect("reduce");

        assert!(selection.overridden);
        assert_eq!(selection.retained, vec!["f0".to_string(), "f1".to_string()]);
        assert_eq!(selection.dropped, vec!["f2".to_string()]);
        assert_eq!(selection.violations.len(), 1);

        let unknown = vec!["nope".to_string()];
        assert!(reduce_features(&matrix, 0.6, &unknown).is_err());
    }

    #[test]
    fn scaled_columns_have_zero_mean_and_unit_sd() {
        let features = latent_features(7, 40, 5);
        let feature_names = names(5);
        let scaling = compute_feature_scaling(&features, &feature_names).expect("scaling");
        let scaled = apply_scaling(features, &scaling);

        for column in scaled.column_iter() {
            let n = column.len() as f64;
            let mean = column.sum() / n;
            let var = column.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(var.sqrt(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn scaling_rejects_constant_features() {
        let features = DMatrix::from_row_slice(3, 1, &[2.0, 2.0, 2.0]);
        let err = compute_feature_scaling(&features, &names(1)).unwrap_err();
        assert!(err.to_string().contains("zero variance"));
    }

    #[test]
    fn stratified_split_is_deterministic_and_disjoint() {
        let mut response = vec![0u8; 48];
        response.extend(vec![1u8; 147]);

        let first = stratified_split(&response, 0.8, 225).expect("split");
        let second = stratified_split(&response, 0.8, 225).expect("split");
        assert_eq!(first, second);

        assert_eq!(first.train.len(), 157);
        assert_eq!(first.test.len(), 38);
        let train_negatives = first.train.iter().filter(|&&i| response[i] == 0).count();
        assert_eq!(train_negatives, 39);

        let mut all: Vec<usize> = first.train.iter().chain(&first.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..195).collect::<Vec<_>>());
    }

    #[test]
    fn stratified_split_changes_with_seed_and_validates_fraction() {
        let response: Vec<u8> = (0..100).map(|i| (i % 2) as u8).collect();
        let a = stratified_split(&response, 0.8, 1).expect("split");
        let b = stratified_split(&response, 0.8, 2).expect("split");
        assert_ne!(a, b);
        assert_eq!(a.train.len(), 80);

        assert!(stratified_split(&response, 1.0, 1).is_err());
        assert!(stratified_split(&response, 0.0, 1).is_err());
    }
}
