//! Exploratory summaries: class balance, per-feature distributions and the
//! pairwise correlation matrix.

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use nalgebra::{DMatrix, DVector};

use crate::config::RunConfig;
use crate::data::{self, Dataset, MissingCount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassBalance {
    pub negatives: usize,
    pub positives: usize,
}

/// Five-number summary plus mean and sample standard deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSummary {
    pub feature: String,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub mean: f64,
    pub q3: f64,
    pub max: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedSummary {
    pub feature: String,
    pub negative: FeatureSummary,
    pub positive: FeatureSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedPair {
    pub first: String,
    pub second: String,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationMatrix {
    pub names: Vec<String>,
    pub values: DMatrix<f64>,
}

impl CorrelationMatrix {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Pairs with |r| strictly above `threshold`, strongest first.
    pub fn pairs_above(&self, threshold: f64) -> Vec<CorrelatedPair> {
        let mut pairs = Vec::new();
        for i in 0..self.len() {
            for j in (i + 1)..self.len() {
                let r = self.values[(i, j)];
                if r.abs() > threshold {
                    pairs.push(CorrelatedPair {
                        first: self.names[i].clone(),
                        second: self.names[j].clone(),
                        r,
                    });
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.r.abs()
                .partial_cmp(&a.r.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pairs
    }

    /// Correlation sub-matrix restricted to `names`.
    pub fn restrict(&self, names: &[String]) -> Option<CorrelationMatrix> {
        let indices = names
            .iter()
            .map(|n| self.index_of(n))
            .collect::<Option<Vec<_>>>()?;
        let values = DMatrix::from_fn(indices.len(), indices.len(), |i, j| {
            self.values[(indices[i], indices[j])]
        });
        Some(CorrelationMatrix {
            names: names.to_vec(),
            values,
        })
    }
}

pub fn class_balance(dataset: &Dataset) -> ClassBalance {
    let positives = dataset.response.iter().filter(|&&y| y == 1).count();
    ClassBalance {
        negatives: dataset.response.len() - positives,
        positives,
    }
}

/// Sample quantile with linear interpolation between order statistics
/// (Hyndman and Fan type 7). `sorted` must be ascending and non-empty.
pub(crate) fn quantile(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

pub(crate) fn mean_and_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    let sd = if values.len() > 1 {
        (ss / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    (mean, sd)
}

fn summarize(feature: &str, values: &[f64]) -> FeatureSummary {
    if values.is_empty() {
        return FeatureSummary {
            feature: feature.to_string(),
            min: f64::NAN,
            q1: f64::NAN,
            median: f64::NAN,
            mean: f64::NAN,
            q3: f64::NAN,
            max: f64::NAN,
            std_dev: f64::NAN,
        };
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let (mean, std_dev) = mean_and_sd(values);

    FeatureSummary {
        feature: feature.to_string(),
        min: sorted[0],
        q1: quantile(&sorted, 0.25),
        median: quantile(&sorted, 0.5),
        mean,
        q3: quantile(&sorted, 0.75),
        max: sorted[sorted.len() - 1],
        std_dev,
    }
}

pub fn feature_summaries(dataset: &Dataset) -> Vec<FeatureSummary> {
    dataset
        .feature_names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let values: Vec<f64> = dataset.features.column(j).iter().copied().collect();
            summarize(name, &values)
        })
        .collect()
}

/// Per-feature summaries split by response class (the boxplot-by-status view).
pub fn grouped_summaries(dataset: &Dataset) -> Vec<GroupedSummary> {
    dataset
        .feature_names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let column = dataset.features.column(j);
            let split = |class: u8| -> Vec<f64> {
                column
                    .iter()
                    .zip(&dataset.response)
                    .filter(|(_, &y)| y == class)
                    .map(|(v, _)| *v)
                    .collect()
            };
            GroupedSummary {
                feature: name.clone(),
                negative: summarize(name, &split(0)),
                positive: summarize(name, &split(1)),
            }
        })
        .collect()
}

/// Pearson correlation between every pair of columns.
pub fn correlation_matrix(features: &DMatrix<f64>, names: &[String]) -> Result<CorrelationMatrix> {
    ensure!(
        features.ncols() == names.len(),
        "correlation input has {} columns but {} names",
        features.ncols(),
        names.len()
    );
    ensure!(
        features.nrows() > 1,
        "at least two rows are needed to compute correlations"
    );

    let mut standardized = Vec::with_capacity(names.len());
    for (j, name) in names.iter().enumerate() {
        let column: DVector<f64> = features.column(j).into_owned();
        let mean = column.mean();
        let centered = column.add_scalar(-mean);
        let norm = centered.norm();
        ensure!(
            norm.is_finite() && norm > 0.0,
            "feature '{}' has zero variance; correlation is undefined",
            name
        );
        standardized.push(centered / norm);
    }

    let p = names.len();
    let values = DMatrix::from_fn(p, p, |i, j| {
        if i == j {
            1.0
        } else {
            standardized[i].dot(&standardized[j]).clamp(-1.0, 1.0)
        }
    });

    Ok(CorrelationMatrix {
        names: names.to_vec(),
        values,
    })
}

#[derive(Debug, Clone)]
pub struct ExploreReport {
    pub rows: usize,
    pub missing: Vec<MissingCount>,
    pub balance: ClassBalance,
    pub summaries: Vec<FeatureSummary>,
    pub grouped: Vec<GroupedSummary>,
    pub correlation: CorrelationMatrix,
}

pub fn explore(dataset: &Dataset, missing: Vec<MissingCount>) -> Result<ExploreReport> {
    let correlation = correlation_matrix(&dataset.features, &dataset.feature_names)?;
    Ok(ExploreReport {
        rows: dataset.nrows(),
        missing,
        balance: class_balance(dataset),
        summaries: feature_summaries(dataset),
        grouped: grouped_summaries(dataset),
        correlation,
    })
}

/// Load the configured dataset, apply the missing-value policy and summarize
/// it. The cleaned dataset is returned for the later stages.
pub fn run_exploration(config: &RunConfig) -> Result<(Dataset, ExploreReport)> {
    let table = data::load_dataset(&config.dataset, &config.id_column, &config.response)?;
    let missing = data::missingness(&table);
    let dataset = data::apply_missing_policy(table, config.missing_policy)?;
    log::info!(
        "Missing-value policy '{}' left {} complete rows",
        config.missing_policy,
        dataset.nrows()
    );

    let report = explore(&dataset, missing)?;
    Ok((dataset, report))
}

impl ExploreReport {
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("Rows: {}", self.rows));

        let total_missing: usize = self.missing.iter().map(|m| m.missing).sum();
        lines.push(format!("Missing cells: {}", total_missing));
        for count in self.missing.iter().filter(|m| m.missing > 0) {
            lines.push(format!("  {:<20} {:>6}", count.column, count.missing));
        }

        lines.push(format!(
            "Class balance: {} negative / {} positive",
            self.balance.negatives, self.balance.positives
        ));

        lines.push(String::new());
        lines.push("Feature summaries:".to_string());
        lines.push(format!(
            "  {:<20} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11}",
            "feature", "min", "q1", "median", "mean", "q3", "max", "sd"
        ));
        for s in &self.summaries {
            lines.push(format!(
                "  {:<20} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5}",
                s.feature, s.min, s.q1, s.median, s.mean, s.q3, s.max, s.std_dev
            ));
        }

        lines.push(String::new());
        lines.push("Distribution by status (median [q1, q3]):".to_string());
        for g in &self.grouped {
            lines.push(format!(
                "  {:<20} 0: {:>10.5} [{:.5}, {:.5}]   1: {:>10.5} [{:.5}, {:.5}]",
                g.feature,
                g.negative.median,
                g.negative.q1,
                g.negative.q3,
                g.positive.median,
                g.positive.q1,
                g.positive.q3
            ));
        }

        lines.push(String::new());
        lines.extend(render_correlation(&self.correlation));
        lines
    }

    pub fn render(&self) -> String {
        self.render_lines().join("\n")
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())
            .with_context(|| format!("failed to write exploration report to {}", path.display()))
    }
}

pub(crate) fn render_correlation(matrix: &CorrelationMatrix) -> Vec<String> {
    let mut lines = vec!["Correlation matrix:".to_string()];
    for (i, name) in matrix.names.iter().enumerate() {
        lines.push(format!("  [{:>2}] {}", i + 1, name));
    }

    let mut header = String::from("      ");
    for j in 0..matrix.len() {
        header.push_str(&format!(" {:>6}", format!("[{}]", j + 1)));
    }
    lines.push(header);

    for i in 0..matrix.len() {
        let mut row = format!("  [{:>2}]", i + 1);
        for j in 0..matrix.len() {
            row.push_str(&format!(" {:>6.2}", matrix.values[(i, j)]));
        }
        lines.push(row);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn small_dataset() -> Dataset {
        Dataset {
            ids: (1..=5).map(|i| format!("r{}", i)).collect(),
            response: vec![0, 1, 1, 0, 1],
            feature_names: names(&["a", "b"]),
            features: DMatrix::from_row_slice(
                5,
                2,
                &[1.0, 10.0, 2.0, 8.0, 3.0, 6.0, 4.0, 4.0, 5.0, 2.0],
            ),
            imputed: Vec::new(),
        }
    }

    #[test]
    fn quantiles_interpolate_like_type_seven() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(quantile(&sorted, 0.25), 1.75);
        assert_abs_diff_eq!(quantile(&sorted, 0.5), 2.5);
        assert_abs_diff_eq!(quantile(&sorted, 1.0), 4.0);
    }

    #[test]
    fn summaries_report_sample_statistics() {
        let dataset = small_dataset();
        let summary = &feature_summaries(&dataset)[0];
        assert_abs_diff_eq!(summary.median, 3.0);
        assert_abs_diff_eq!(summary.mean, 3.0);
        assert_abs_diff_eq!(summary.std_dev, 2.5_f64.sqrt(), epsilon = 1e-12);

        let grouped = &grouped_summaries(&dataset)[0];
        assert_abs_diff_eq!(grouped.negative.median, 2.5);
        assert_abs_diff_eq!(grouped.positive.median, 3.0);
        assert_eq!(class_balance(&dataset), ClassBalance { negatives: 2, positives: 3 });
    }

    #[test]
    fn correlation_of_reversed_columns_is_negative_one() {
        let dataset = small_dataset();
        let matrix = correlation_matrix(&dataset.features, &dataset.feature_names).expect("corr");
        assert_abs_diff_eq!(matrix.values[(0, 1)], -1.0, epsilon = 1e-12);
        assert_eq!(matrix.pairs_above(0.6).len(), 1);
        assert!(matrix.pairs_above(1.0).is_empty());
    }

    #[test]
    fn correlation_rejects_constant_columns() {
        let features = DMatrix::from_row_slice(3, 2, &[1.0, 5.0, 2.0, 5.0, 3.0, 5.0]);
        let err = correlation_matrix(&features, &names(&["a", "b"])).unwrap_err();
        assert!(err.to_string().contains("feature 'b' has zero variance"));
    }

    #[test]
    fn restrict_selects_sub_matrix() {
        let features = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 2.0, 1.0, 2.0, 1.0, 3.0, 3.0, 4.0, 2.0, 4.0, 3.0, 5.0],
        );
        let matrix = correlation_matrix(&features, &names(&["a", "b", "c"])).expect("corr");
        let sub = matrix.restrict(&names(&["c", "a"])).expect("restrict");
        assert_abs_diff_eq!(sub.values[(0, 1)], matrix.values[(2, 0)]);
        assert!(matrix.restrict(&names(&["z"])).is_none());
    }

    #[test]
    fn exploration_report_is_written_to_disk() {
        let report = explore(&small_dataset(), Vec::new()).expect("explore");
        let dir = tempfile::TempDir::new().expect("tempdir");

        let output = dir.path().join("explore.txt");
        report.persist(&output).expect("persist");
        let written = fs::read_to_string(&output).expect("read report");
        assert_eq!(written, report.render());

        let err = report
            .persist(&dir.path().join("missing").join("explore.txt"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("failed to write exploration report"));
    }
}
