//! Synthetic logistic data shared by the regression unit tests.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::formula::ModelFrame;
use super::solve::sigmoid;

/// Owned predictor matrix and response, from which `ModelFrame`s are borrowed.
#[derive(Clone, Debug)]
pub struct SyntheticData {
    pub names: Vec<String>,
    pub features: DMatrix<f64>,
    pub response: DVector<f64>,
}

impl SyntheticData {
    pub fn frame(&self) -> ModelFrame<'_> {
        ModelFrame::new(&self.names, &self.features, &self.response).expect("synthetic frame")
    }
}

/// Builder for data where `logit(p) = intercept + sum(beta_j * x_j)` with
/// predictors drawn uniformly from [-2, 2]. Extra columns beyond the
/// supplied coefficients are pure noise.
pub struct SyntheticDataBuilder {
    rows: usize,
    columns: usize,
    intercept: f64,
    coefficients: Vec<f64>,
    seed: u64,
}

impl SyntheticDataBuilder {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            columns: 3,
            intercept: 0.3,
            coefficients: vec![1.5, -1.0],
            seed: 42,
        }
    }

    pub fn columns(mut self, columns: usize) -> Self {
        self.columns = columns;
        self
    }

    pub fn coefficients(mut self, coefficients: Vec<f64>) -> Self {
        self.coefficients = coefficients;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> SyntheticData {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let features = DMatrix::from_fn(self.rows, self.columns, |_, _| rng.gen_range(-2.0..2.0));
        let response = DVector::from_fn(self.rows, |i, _| {
            let eta = self.intercept
                + self
                    .coefficients
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j < self.columns)
                    .map(|(j, b)| b * features[(i, j)])
                    .sum::<f64>();
            if rng.gen::<f64>() < sigmoid(eta) {
                1.0
            } else {
                0.0
            }
        });
        let names = (1..=self.columns).map(|j| format!("x{}", j)).collect();
        SyntheticData {
            names,
            features,
            response,
        }
    }
}
