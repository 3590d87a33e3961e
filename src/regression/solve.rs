use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use super::distribution::two_sided_normal_p;
use super::formula::{Formula, ModelFrame};

pub const DEFAULT_MAX_ITERATIONS: usize = 25;
pub const DEFAULT_TOLERANCE: f64 = 1e-8;

/// Probabilities closer than this to 0 or 1 are treated as boundary fits.
pub(crate) const PROBABILITY_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("model frame has no observations")]
    EmptyDesign,

    #[error("term references column '{0}', which is not in the model frame")]
    UnknownColumn(String),

    #[error(
        "IRLS did not converge within {max_iterations} iterations; last relative deviance change was {last_change:.6e}"
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("information matrix X'WX is singular at IRLS iteration {iteration}; predictors may be collinear")]
    SingularInformation { iteration: usize },

    #[error("non-finite coefficients at IRLS iteration {iteration}; the data may be separable")]
    NonFinite { iteration: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// One row of a coefficient summary table.
#[derive(Debug, Clone)]
pub struct CoefficientRow {
    pub label: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    pub p_value: f64,
}

/// Immutable result of one binomial-logit fit.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub formula: Formula,
    pub coefficients: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub std_errors: DVector<f64>,
    pub fitted: DVector<f64>,
    pub weights: DVector<f64>,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    pub n_obs: usize,
    pub iterations: usize,
    pub boundary: bool,
}

impl LogisticFit {
    pub fn parameter_count(&self) -> usize {
        self.coefficients.len()
    }

    pub fn residual_df(&self) -> usize {
        self.n_obs.saturating_sub(self.parameter_count())
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.parameter_count() as f64
    }

    pub fn coefficient_table(&self) -> Vec<CoefficientRow> {
        self.formula
            .coefficient_labels()
            .into_iter()
            .enumerate()
            .map(|(j, label)| {
                let estimate = self.coefficients[j];
                let std_error = self.std_errors[j];
                let z_value = estimate / std_error;
                CoefficientRow {
                    label,
                    estimate,
                    std_error,
                    z_value,
                    p_value: two_sided_normal_p(z_value),
                }
            })
            .collect()
    }
}

pub(crate) fn solve_linear(design: &DMatrix<f64>, target: &DVector<f64>) -> Result<DVector<f64>> {
    let gram = design.transpose() * design;
    let rhs = design.transpose() * target;

    let chol = gram
        .cholesky()
        .ok_or_else(|| anyhow!("failed to factor design matrix; columns may be collinear"))?;

    Ok(chol.solve(&rhs))
}

pub fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

// log(1 + exp(eta)) without overflow.
fn softplus(eta: f64) -> f64 {
    eta.max(0.0) + (-eta.abs()).exp().ln_1p()
}

/// Bernoulli log-likelihood evaluated on the linear predictor scale.
pub(crate) fn log_likelihood(response: &DVector<f64>, eta: &DVector<f64>) -> f64 {
    response
        .iter()
        .zip(eta.iter())
        .map(|(y, e)| y * e - softplus(*e))
        .sum()
}

fn null_deviance(response: &DVector<f64>) -> f64 {
    let n = response.len() as f64;
    let positives = response.iter().sum::<f64>();
    let negatives = n - positives;
    if positives == 0.0 || negatives == 0.0 {
        return 0.0;
    }
    let p = positives / n;
    -2.0 * (positives * p.ln() + negatives * (1.0 - p).ln())
}

/// Fit a logistic regression by iteratively reweighted least squares.
pub fn fit_logistic(
    formula: &Formula,
    frame: &ModelFrame<'_>,
    options: &FitOptions,
) -> Result<LogisticFit, FitError> {
    let design = formula.design_matrix(frame)?;
    let response = frame.response();
    let n = design.nrows();

    let mut mu = response.map(|y| (y + 0.5) / 2.0);
    let mut eta = mu.map(|m| (m / (1.0 - m)).ln());
    let mut deviance = -2.0 * log_likelihood(response, &eta);
    let mut last_change = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        let weights = mu.map(|m| {
            let m = m.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
            m * (1.0 - m)
        });
        let working = DVector::from_iterator(
            n,
            (0..n).map(|i| eta[i] + (response[i] - mu[i]) / weights[i]),
        );

        let mut weighted = design.clone();
        for (i, mut row) in weighted.row_iter_mut().enumerate() {
            row *= weights[i];
        }
        let information = design.transpose() * &weighted;
        let rhs = weighted.transpose() * &working;

        let chol = information
            .cholesky()
            .ok_or(FitError::SingularInformation { iteration })?;
        let beta = chol.solve(&rhs);
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(FitError::NonFinite { iteration });
        }

        eta = &design * &beta;
        mu = eta.map(sigmoid);
        let log_lik = log_likelihood(response, &eta);
        let next_deviance = -2.0 * log_lik;
        last_change = (next_deviance - deviance).abs() / (next_deviance.abs() + 0.1);
        deviance = next_deviance;

        log::debug!(
            "IRLS iteration #{:<2} | deviance {:<14.8} | change {:.3e} | {}",
            iteration,
            deviance,
            last_change,
            formula
        );

        if last_change < options.tolerance {
            return finish_fit(formula, &design, response, beta, mu, log_lik, iteration);
        }
    }

    log::warn!(
        "IRLS failed to converge after {} iterations for {}",
        options.max_iterations,
        formula
    );
    Err(FitError::DidNotConverge {
        max_iterations: options.max_iterations,
        last_change,
    })
}

fn finish_fit(
    formula: &Formula,
    design: &DMatrix<f64>,
    response: &DVector<f64>,
    coefficients: DVector<f64>,
    fitted: DVector<f64>,
    log_likelihood: f64,
    iterations: usize,
) -> Result<LogisticFit, FitError> {
    let weights = fitted.map(|m| {
        let m = m.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
        m * (1.0 - m)
    });
    let mut weighted = design.clone();
    for (i, mut row) in weighted.row_iter_mut().enumerate() {
        row *= weights[i];
    }
    let information = design.transpose() * &weighted;
    let covariance = information
        .cholesky()
        .ok_or(FitError::SingularInformation {
            iteration: iterations,
        })?
        .inverse();
    let std_errors = covariance.diagonal().map(|v| v.max(0.0).sqrt());

    let boundary = fitted
        .iter()
        .any(|&m| m < PROBABILITY_FLOOR || m > 1.0 - PROBABILITY_FLOOR);
    if boundary {
        log::warn!("fitted probabilities numerically 0 or 1 occurred for {}", formula);
    }

    Ok(LogisticFit {
        formula: formula.clone(),
        coefficients,
        covariance,
        std_errors,
        fitted,
        weights,
        log_likelihood,
        deviance: -2.0 * log_likelihood,
        null_deviance: null_deviance(response),
        n_obs: design.nrows(),
        iterations,
        boundary,
    })
}

/// Probabilities for the rows of another frame under a fitted model.
pub fn predict_probabilities(
    fit: &LogisticFit,
    frame: &ModelFrame<'_>,
) -> Result<DVector<f64>, FitError> {
    let design = fit.formula.design_matrix(frame)?;
    Ok((design * &fit.coefficients).map(sigmoid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_design_and_target() -> (DMatrix<f64>, DVector<f64>) {
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let target = DVector::from_vec(vec![1.0, 3.0, 5.0]);
        (design, target)
    }

    // Ten rows with x = 0 (3 positives) and ten with x = 1 (6 positives).
    fn binary_predictor_frame() -> (Vec<String>, DMatrix<f64>, DVector<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..10 {
            x.push(0.0);
            y.push(if i < 3 { 1.0 } else { 0.0 });
        }
        for i in 0..10 {
            x.push(1.0);
            y.push(if i < 6 { 1.0 } else { 0.0 });
        }
        (
            vec!["x".to_string()],
            DMatrix::from_column_slice(20, 1, &x),
            DVector::from_vec(y),
        )
    }

    #[test]
    fn solve_linear_recovers_exact_coefficients() {
        let (design, target) = sample_design_and_target();
        let beta = solve_linear(&design, &target).expect("ols solution");

        assert_abs_diff_eq!(beta[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(beta[1], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn fit_logistic_recovers_closed_form_log_odds() {
        let (names, features, response) = binary_predictor_frame();
        let frame = ModelFrame::new(&names, &features, &response).expect("frame");
        let formula = Formula::additive("y", &names);

        let fit = fit_logistic(&formula, &frame, &FitOptions::default()).expect("fit");

        let intercept = (3.0_f64 / 7.0).ln();
        let slope = (6.0_f64 / 4.0).ln() - intercept;
        assert_abs_diff_eq!(fit.coefficients[0], intercept, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.coefficients[1], slope, epsilon = 1e-6);

        // Wald SEs for a 2x2 table: sqrt(1/a + 1/b (+ 1/c + 1/d)).
        let se_intercept = (1.0_f64 / 3.0 + 1.0 / 7.0).sqrt();
        let se_slope = (1.0_f64 / 3.0 + 1.0 / 7.0 + 1.0 / 6.0 + 1.0 / 4.0).sqrt();
        assert_abs_diff_eq!(fit.std_errors[0], se_intercept, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.std_errors[1], se_slope, epsilon = 1e-5);

        assert_eq!(fit.residual_df(), 18);
        assert!(!fit.boundary);
        assert!(fit.deviance < fit.null_deviance);
        assert_abs_diff_eq!(fit.aic(), fit.deviance + 4.0, epsilon = 1e-12);
    }

    #[test]
    fn fitted_probabilities_match_group_rates() {
        let (names, features, response) = binary_predictor_frame();
        let frame = ModelFrame::new(&names, &features, &response).expect("frame");
        let fit = fit_logistic(&Formula::additive("y", &names), &frame, &FitOptions::default())
            .expect("fit");

        let probabilities = predict_probabilities(&fit, &frame).expect("predict");
        assert_abs_diff_eq!(probabilities[0], 0.3, epsilon = 1e-8);
        assert_abs_diff_eq!(probabilities[19], 0.6, epsilon = 1e-8);
    }

    #[test]
    fn intercept_only_deviance_equals_null_deviance() {
        let (names, features, response) = binary_predictor_frame();
        let frame = ModelFrame::new(&names, &features, &response).expect("frame");
        let fit = fit_logistic(&Formula::new("y", vec![]), &frame, &FitOptions::default())
            .expect("fit");

        assert_abs_diff_eq!(fit.deviance, fit.null_deviance, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.coefficients[0], (9.0_f64 / 11.0).ln(), epsilon = 1e-8);
    }

    #[test]
    fn separable_data_is_never_reported_as_a_clean_fit() {
        let names = vec!["x".to_string()];
        let features = DMatrix::from_column_slice(6, 1, &[-3.0, -2.0, -1.0, 1.0, 2.0, 3.0]);
        let response = DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let frame = ModelFrame::new(&names, &features, &response).expect("frame");

        match fit_logistic(
            &Formula::additive("y", &names),
            &frame,
            &FitOptions::default(),
        ) {
            Ok(fit) => assert!(fit.boundary),
            Err(err) => assert!(matches!(
                err,
                FitError::DidNotConverge { .. }
                    | FitError::NonFinite { .. }
                    | FitError::SingularInformation { .. }
            )),
        }
    }

    #[test]
    fn iteration_cap_produces_did_not_converge() {
        let (names, features, response) = binary_predictor_frame();
        let frame = ModelFrame::new(&names, &features, &response).expect("frame");
        let options = FitOptions {
            max_iterations: 1,
            tolerance: 1e-12,
        };

        let err = fit_logistic(&Formula::additive("y", &names), &frame, &options).unwrap_err();
        assert!(matches!(
            err,
            FitError::DidNotConverge {
                max_iterations: 1,
                ..
            }
        ));
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(800.0) <= 1.0);
        assert!(sigmoid(-800.0) >= 0.0);
        assert_abs_diff_eq!(softplus(-800.0), 0.0);
        assert_abs_diff_eq!(softplus(800.0), 800.0);
    }
}
