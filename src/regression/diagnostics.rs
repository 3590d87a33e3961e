use anyhow::{anyhow, ensure, Result};
use nalgebra::{DMatrix, DVector};

use super::distribution::normal_quantile;
use super::formula::ModelFrame;
use super::solve::{solve_linear, LogisticFit, PROBABILITY_FLOOR};

const LOWESS_ROBUSTNESS_ITERS: usize = 3;

/// Outcome of a single diagnostic check. Checks never alter the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Flag(Vec<String>),
}

impl Verdict {
    fn from_flags(flags: Vec<String>) -> Self {
        if flags.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Flag(flags)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticOptions {
    pub lowess_span: f64,
    pub linearity_min_r2: f64,
    pub influence_top_k: usize,
    pub outlier_bound: f64,
    pub vif_bound: f64,
}

/// Summary statistics for residuals produced by a regression fit.
#[derive(Debug, Clone)]
pub struct ResidualSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub max_abs: f64,
}

#[derive(Debug, Clone)]
pub struct LinearityCheck {
    pub predictor: String,
    /// R^2 of a straight line through the smoothed logit curve.
    pub score: f64,
    pub slope: f64,
    /// Smoothed (predictor, logit) points in ascending predictor order.
    pub curve: Vec<(f64, f64)>,
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct ObservationValue {
    pub label: String,
    pub value: f64,
}

/// Leverage and influence diagnostics for a binomial fit.
#[derive(Debug, Clone)]
pub struct InfluenceDiagnostics {
    pub cooks_threshold: f64,
    pub top_cooks: Vec<ObservationValue>,
    pub high_cooks: Vec<ObservationValue>,
    pub outlier_bound: f64,
    pub outliers: Vec<ObservationValue>,
    pub max_leverage: f64,
    /// (half-normal quantile, sorted |studentized residual|)
    pub half_normal: Vec<(f64, f64)>,
    pub deviance_residuals: ResidualSummary,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct VifEntry {
    pub term: String,
    pub vif: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub linearity: Vec<LinearityCheck>,
    pub linearity_verdict: Verdict,
    pub influence: InfluenceDiagnostics,
    pub influence_verdict: Verdict,
    pub vif: Vec<VifEntry>,
    pub vif_bound: f64,
    pub vif_verdict: Verdict,
}

pub fn run_diagnostics(
    fit: &LogisticFit,
    frame: &ModelFrame<'_>,
    labels: &[String],
    options: &DiagnosticOptions,
) -> Result<Diagnostics> {
    ensure!(
        labels.len() == frame.nrows(),
        "expected {} observation labels, got {}",
        frame.nrows(),
        labels.len()
    );

    let linearity = logit_linearity(fit, frame, options.lowess_span, options.linearity_min_r2)?;
    let linearity_verdict = Verdict::from_flags(
        linearity
            .iter()
            .filter(|c| c.flagged)
            .map(|c| format!("{} (R^2 = {:.3})", c.predictor, c.score))
            .collect(),
    );

    let influence = leverage_and_influence(
        fit,
        frame,
        labels,
        options.influence_top_k,
        options.outlier_bound,
    )?;
    let influence_verdict = Verdict::from_flags(
        influence
            .high_cooks
            .iter()
            .map(|o| {
                format!(
                    "{} (Cook's D = {:.4} > {:.4})",
                    o.label, o.value, influence.cooks_threshold
                )
            })
            .chain(
                influence
                    .outliers
                    .iter()
                    .map(|o| format!("{} (|r| = {:.3})", o.label, o.value.abs())),
            )
            .collect(),
    );

    let vif = variance_inflation(fit, options.vif_bound)?;
    let vif_verdict = Verdict::from_flags(
        vif.iter()
            .filter(|v| v.flagged)
            .map(|v| format!("{} (VIF = {:.3})", v.term, v.vif))
            .collect(),
    );

    Ok(Diagnostics {
        linearity,
        linearity_verdict,
        influence,
        influence_verdict,
        vif,
        vif_bound: options.vif_bound,
        vif_verdict,
    })
}

pub(crate) fn summarize_residuals(residuals: &DVector<f64>) -> ResidualSummary {
    let n = residuals.len().max(1) as f64;
    let mean = residuals.iter().sum::<f64>() / n;

    let mut variance_sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut max_abs = 0.0;

    for value in residuals.iter().copied() {
        variance_sum += {
            let diff = value - mean;
            diff * diff
        };
        if value < min {
            min = value;
        }
        if value > max {
            max = value;
        }
        let abs = value.abs();
        if abs > max_abs {
            max_abs = abs;
        }
    }

    let std_dev = (variance_sum / n).sqrt();

    ResidualSummary {
        mean,
        std_dev,
        min,
        max,
        max_abs,
    }
}

/// LOWESS smoother (tricube neighbourhood weights, bisquare robustness
/// weights). Returns the sorted x values with their smoothed y values.
pub fn lowess(x: &[f64], y: &[f64], span: f64, robustness_iters: usize) -> Vec<(f64, f64)> {
    let n = x.len().min(y.len());
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap_or(std::cmp::Ordering::Equal));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();

    if n == 1 {
        return vec![(xs[0], ys[0])];
    }

    let neighbours = ((span * n as f64 + 1e-7) as usize).clamp(2, n);
    let range = xs[n - 1] - xs[0];
    let mut robustness = vec![1.0; n];
    let mut smoothed = vec![0.0; n];

    for pass in 0..=robustness_iters {
        let mut left = 0usize;
        let mut right = neighbours - 1;

        for i in 0..n {
            while right < n - 1 && xs[i] - xs[left] > xs[right + 1] - xs[i] {
                left += 1;
                right += 1;
            }
            let h = (xs[i] - xs[left]).max(xs[right] - xs[i]);
            smoothed[i] = local_linear(&xs, &ys, &robustness, i, left, h, range);
        }

        if pass == robustness_iters {
            break;
        }

        let residuals: Vec<f64> = ys.iter().zip(&smoothed).map(|(y, s)| y - s).collect();
        let mut abs_sorted: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
        abs_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = crate::explore::quantile(&abs_sorted, 0.5);
        let scale = 6.0 * median;
        let y_level = ys.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
        if scale < 1e-7 * y_level || scale == 0.0 {
            break;
        }

        for (weight, residual) in robustness.iter_mut().zip(&residuals) {
            let r = residual.abs();
            *weight = if r <= 0.001 * scale {
                1.0
            } else if r > 0.999 * scale {
                0.0
            } else {
                let u = r / scale;
                (1.0 - u * u).powi(2)
            };
        }
    }

    xs.into_iter().zip(smoothed).collect()
}

// Weighted local line through the neighbourhood of `xs[i]` starting at `left`.
fn local_linear(
    xs: &[f64],
    ys: &[f64],
    robustness: &[f64],
    i: usize,
    left: usize,
    h: f64,
    range: f64,
) -> f64 {
    let n = xs.len();
    let mut weights = vec![0.0; n];
    let h_inner = 0.001 * h;
    let h_outer = 0.999 * h;

    let mut j = left;
    while j < n {
        let d = (xs[j] - xs[i]).abs();
        if d <= h_outer {
            let w = if d <= h_inner {
                1.0
            } else {
                let u = d / h;
                (1.0 - u.powi(3)).powi(3)
            };
            weights[j] = w * robustness[j];
        } else if xs[j] > xs[i] {
            break;
        }
        j += 1;
    }

    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return ys[i];
    }
    for w in weights.iter_mut() {
        *w /= total;
    }

    if h > 0.0 {
        let center: f64 = weights.iter().zip(xs).map(|(w, x)| w * x).sum();
        let spread: f64 = weights
            .iter()
            .zip(xs)
            .map(|(w, x)| w * (x - center) * (x - center))
            .sum();
        if spread.sqrt() > 0.001 * range {
            let b = (xs[i] - center) / spread;
            for (w, x) in weights.iter_mut().zip(xs) {
                *w *= 1.0 + b * (x - center);
            }
        }
    }

    weights.iter().zip(ys).map(|(w, y)| w * y).sum()
}

fn empirical_logit(p: f64) -> f64 {
    let p = p.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
    (p / (1.0 - p)).ln()
}

/// Smooth the fitted logit against each main-effect predictor and score how
/// well a straight line describes the smoothed curve.
pub fn logit_linearity(
    fit: &LogisticFit,
    frame: &ModelFrame<'_>,
    span: f64,
    min_r2: f64,
) -> Result<Vec<LinearityCheck>> {
    let logits: Vec<f64> = fit.fitted.iter().map(|&p| empirical_logit(p)).collect();

    let mut checks = Vec::new();
    for predictor in fit.formula.main_effects() {
        let values: Vec<f64> = frame.column(predictor)?.iter().copied().collect();
        let curve = lowess(&values, &logits, span, LOWESS_ROBUSTNESS_ITERS);

        let xs = DVector::from_iterator(curve.len(), curve.iter().map(|(x, _)| *x));
        let smooth = DVector::from_iterator(curve.len(), curve.iter().map(|(_, s)| *s));
        let design = DMatrix::from_fn(curve.len(), 2, |i, j| if j == 0 { 1.0 } else { xs[i] });
        let line = solve_linear(&design, &smooth)?;

        let mean = smooth.mean();
        let ss_tot: f64 = smooth.iter().map(|s| (s - mean) * (s - mean)).sum();
        let ss_res: f64 = (&smooth - &design * &line).iter().map(|r| r * r).sum();
        let score = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

        checks.push(LinearityCheck {
            predictor: predictor.to_string(),
            score,
            slope: line[1],
            curve,
            flagged: score < min_r2,
        });
    }

    Ok(checks)
}

pub(crate) fn leverage_and_influence(
    fit: &LogisticFit,
    frame: &ModelFrame<'_>,
    labels: &[String],
    top_k: usize,
    outlier_bound: f64,
) -> Result<InfluenceDiagnostics> {
    let design = fit.formula.design_matrix(frame)?;
    let n = design.nrows();
    let p = design.ncols();
    let response = frame.response();
    ensure!(
        n > p,
        "not enough observations ({}) for influence diagnostics with {} parameters",
        n,
        p
    );

    let mut deviance_residuals = Vec::with_capacity(n);
    let mut cooks_values = Vec::with_capacity(n);
    let mut studentized = Vec::with_capacity(n);
    let mut max_leverage = 0.0_f64;
    let mut skipped = 0usize;

    for idx in 0..n {
        let y = response[idx];
        let mu = fit.fitted[idx].clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
        let weight = mu * (1.0 - mu);

        let row = design.row(idx).transpose();
        let leverage = weight * (row.transpose() * &fit.covariance * &row)[(0, 0)];

        let pearson = (y - mu) / weight.sqrt();
        let unit_deviance = if y > 0.5 {
            -2.0 * mu.ln()
        } else {
            -2.0 * (1.0 - mu).ln()
        };
        let deviance = (y - mu).signum() * unit_deviance.sqrt();
        deviance_residuals.push(deviance);

        if !leverage.is_finite() || leverage >= 1.0 {
            // Cook's distance is undefined when leverage is 1.
            skipped += 1;
            continue;
        }
        max_leverage = max_leverage.max(leverage);

        let cooks = (pearson / (1.0 - leverage)).powi(2) * leverage / p as f64;
        if cooks.is_finite() {
            cooks_values.push(ObservationValue {
                label: labels[idx].clone(),
                value: cooks,
            });
        }

        let rstudent = deviance.signum()
            * (deviance * deviance + leverage * pearson * pearson / (1.0 - leverage)).sqrt();
        if rstudent.is_finite() {
            studentized.push(ObservationValue {
                label: labels[idx].clone(),
                value: rstudent,
            });
        }
    }

    let cooks_threshold = 4.0 / n as f64;
    let mut high_cooks: Vec<ObservationValue> = cooks_values
        .iter()
        .filter(|c| c.value > cooks_threshold)
        .cloned()
        .collect();
    sort_descending(&mut high_cooks);

    let mut top_cooks = cooks_values;
    sort_descending(&mut top_cooks);
    top_cooks.truncate(top_k);

    let outliers: Vec<ObservationValue> = studentized
        .iter()
        .filter(|r| r.value.abs() > outlier_bound)
        .cloned()
        .collect();

    let mut magnitudes: Vec<f64> = studentized.iter().map(|r| r.value.abs()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let m = magnitudes.len() as f64;
    let half_normal = magnitudes
        .into_iter()
        .enumerate()
        .map(|(i, value)| (normal_quantile((m + i as f64 + 1.0) / (2.0 * m + 1.0)), value))
        .collect();

    Ok(InfluenceDiagnostics {
        cooks_threshold,
        top_cooks,
        high_cooks,
        outlier_bound,
        outliers,
        max_leverage,
        half_normal,
        deviance_residuals: summarize_residuals(&DVector::from_vec(deviance_residuals)),
        skipped,
    })
}

fn sort_descending(values: &mut [ObservationValue]) {
    values.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Variance inflation factors from the coefficient covariance matrix: with
/// the intercept removed and the covariance rescaled to a correlation matrix
/// `R`, the factor for coefficient `j` is `(R^-1)_jj`.
pub fn variance_inflation(fit: &LogisticFit, bound: f64) -> Result<Vec<VifEntry>> {
    let labels = fit.formula.coefficient_labels();
    let k = labels.len().saturating_sub(1);
    if k == 0 {
        return Ok(Vec::new());
    }

    let vifs: Vec<f64> = if k == 1 {
        vec![1.0]
    } else {
        let cov = fit.covariance.view((1, 1), (k, k)).into_owned();
        let scale: Vec<f64> = (0..k).map(|j| cov[(j, j)].sqrt()).collect();
        ensure!(
            scale.iter().all(|s| s.is_finite() && *s > 0.0),
            "coefficient covariance has a non-positive variance"
        );
        let correlation = DMatrix::from_fn(k, k, |i, j| cov[(i, j)] / (scale[i] * scale[j]));
        let inverse = correlation
            .try_inverse()
            .ok_or_else(|| anyhow!("coefficient correlation matrix is singular"))?;
        (0..k).map(|j| inverse[(j, j)]).collect()
    };

    Ok(labels
        .into_iter()
        .skip(1)
        .zip(vifs)
        .map(|(term, vif)| VifEntry {
            term,
            vif,
            flagged: vif > bound,
        })
        .collect())
}
