use anyhow::{ensure, Result};
use nalgebra::DVector;

use super::distribution::normal_quantile;
use super::solve::LogisticFit;

pub const DEFAULT_CLASSIFICATION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct OddsRatio {
    pub term: String,
    pub odds_ratio: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Exponentiated coefficients with Wald intervals `exp(beta +/- z * se)`.
pub fn odds_ratios(fit: &LogisticFit, level: f64) -> Result<Vec<OddsRatio>> {
    ensure!(
        level > 0.0 && level < 1.0,
        "confidence level must lie in (0, 1), got {}",
        level
    );
    let z = normal_quantile((1.0 + level) / 2.0);

    Ok(fit
        .formula
        .coefficient_labels()
        .into_iter()
        .enumerate()
        .map(|(j, term)| {
            let beta = fit.coefficients[j];
            let se = fit.std_errors[j];
            OddsRatio {
                term,
                odds_ratio: beta.exp(),
                lower: (beta - z * se).exp(),
                upper: (beta + z * se).exp(),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn metrics(&self) -> ClassificationMetrics {
        let ratio = |num: usize, den: usize| {
            if den == 0 {
                None
            } else {
                Some(num as f64 / den as f64)
            }
        };

        let precision = ratio(self.true_positive, self.true_positive + self.false_positive);
        let recall = ratio(self.true_positive, self.true_positive + self.false_negative);
        let f1 = match (precision, recall) {
            (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
            _ => None,
        };
        let accuracy = ratio(self.true_positive + self.true_negative, self.total()).unwrap_or(0.0);

        ClassificationMetrics {
            precision,
            recall,
            f1,
            accuracy,
        }
    }
}

/// Precision, recall and F1 for the positive class; `None` when undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationMetrics {
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub accuracy: f64,
}

/// Predict positive when `p >= threshold` and tabulate against the truth.
pub fn confusion_matrix(
    truth: &DVector<f64>,
    probabilities: &DVector<f64>,
    threshold: f64,
) -> Result<ConfusionMatrix> {
    ensure!(
        truth.len() == probabilities.len(),
        "{} labels but {} predictions",
        truth.len(),
        probabilities.len()
    );

    let mut matrix = ConfusionMatrix::default();
    for (&actual, &p) in truth.iter().zip(probabilities.iter()) {
        let predicted = p >= threshold;
        match (actual > 0.5, predicted) {
            (true, true) => matrix.true_positive += 1,
            (false, true) => matrix.false_positive += 1,
            (false, false) => matrix.true_negative += 1,
            (true, false) => matrix.false_negative += 1,
        }
    }
    Ok(matrix)
}
