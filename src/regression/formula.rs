use std::fmt;

use nalgebra::{DMatrix, DVector};

use super::solve::FitError;

pub const INTERCEPT_LABEL: &str = "(Intercept)";

/// A single model term: a main effect or a two-way interaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Main(String),
    Interaction(String, String),
}

impl Term {
    pub fn main(name: impl Into<String>) -> Self {
        Term::Main(name.into())
    }

    /// Interactions are stored with their variables in lexical order so that
    /// `a:b` and `b:a` compare equal.
    pub fn interaction(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Term::Interaction(a, b)
        } else {
            Term::Interaction(b, a)
        }
    }

    pub fn involves(&self, name: &str) -> bool {
        match self {
            Term::Main(var) => var == name,
            Term::Interaction(a, b) => a == name || b == name,
        }
    }

    pub fn is_interaction(&self) -> bool {
        matches!(self, Term::Interaction(..))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Main(var) => write!(f, "{}", var),
            Term::Interaction(a, b) => write!(f, "{}:{}", a, b),
        }
    }
}

/// All two-way interactions among `names`, in input order.
pub fn pairwise_interactions(names: &[String]) -> Vec<Term> {
    let mut terms = Vec::new();
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            terms.push(Term::interaction(a.clone(), b.clone()));
        }
    }
    terms
}

/// Right-hand side of a logistic model. The intercept is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    response: String,
    terms: Vec<Term>,
}

impl Formula {
    pub fn new(response: impl Into<String>, terms: Vec<Term>) -> Self {
        let mut deduped: Vec<Term> = Vec::with_capacity(terms.len());
        for term in terms {
            if !deduped.contains(&term) {
                deduped.push(term);
            }
        }
        Self {
            response: response.into(),
            terms: deduped,
        }
    }

    pub fn additive(response: impl Into<String>, names: &[String]) -> Self {
        Self::new(response, names.iter().cloned().map(Term::Main).collect())
    }

    /// Additive model over `names` plus every pairwise interaction among
    /// `interacting` (a subset of `names`).
    pub fn with_pairwise_interactions(
        response: impl Into<String>,
        names: &[String],
        interacting: &[String],
    ) -> Self {
        let mut terms: Vec<Term> = names.iter().cloned().map(Term::Main).collect();
        terms.extend(pairwise_interactions(interacting));
        Self::new(response, terms)
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn contains(&self, term: &Term) -> bool {
        self.terms.contains(term)
    }

    pub fn parameter_count(&self) -> usize {
        self.terms.len() + 1
    }

    pub fn without(&self, term: &Term) -> Self {
        Self {
            response: self.response.clone(),
            terms: self.terms.iter().filter(|t| *t != term).cloned().collect(),
        }
    }

    pub fn with(&self, term: Term) -> Self {
        let mut terms = self.terms.clone();
        if !terms.contains(&term) {
            terms.push(term);
        }
        Self {
            response: self.response.clone(),
            terms,
        }
    }

    /// True when every term of `self` also appears in `other`.
    pub fn is_nested_in(&self, other: &Formula) -> bool {
        self.response == other.response && self.terms.iter().all(|t| other.contains(t))
    }

    pub fn same_terms(&self, other: &Formula) -> bool {
        self.is_nested_in(other) && other.is_nested_in(self)
    }

    /// Terms that may be removed without breaking marginality: a main effect
    /// stays while any interaction involving it remains.
    pub fn droppable_terms(&self) -> Vec<Term> {
        self.terms
            .iter()
            .filter(|term| match term {
                Term::Interaction(..) => true,
                Term::Main(var) => !self
                    .terms
                    .iter()
                    .any(|other| other.is_interaction() && other.involves(var)),
            })
            .cloned()
            .collect()
    }

    /// Scope terms not yet in the model whose marginal terms are present.
    pub fn addable_terms(&self, scope: &[Term]) -> Vec<Term> {
        scope
            .iter()
            .filter(|term| !self.contains(term))
            .filter(|term| match term {
                Term::Main(_) => true,
                Term::Interaction(a, b) => {
                    self.contains(&Term::Main(a.clone())) && self.contains(&Term::Main(b.clone()))
                }
            })
            .cloned()
            .collect()
    }

    /// Continuous predictors entering as main effects.
    pub fn main_effects(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter_map(|term| match term {
                Term::Main(var) => Some(var.as_str()),
                Term::Interaction(..) => None,
            })
            .collect()
    }

    pub fn coefficient_labels(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(self.parameter_count());
        labels.push(INTERCEPT_LABEL.to_string());
        labels.extend(self.terms.iter().map(|t| t.to_string()));
        labels
    }

    /// Intercept column followed by one column per term.
    pub fn design_matrix(&self, frame: &ModelFrame<'_>) -> Result<DMatrix<f64>, FitError> {
        let rows = frame.nrows();
        if rows == 0 {
            return Err(FitError::EmptyDesign);
        }

        let mut design = DMatrix::from_element(rows, self.parameter_count(), 1.0);
        for (j, term) in self.terms.iter().enumerate() {
            let column = match term {
                Term::Main(var) => frame.column(var)?,
                Term::Interaction(a, b) => frame.column(a)?.component_mul(&frame.column(b)?),
            };
            design.set_column(j + 1, &column);
        }

        Ok(design)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "{} ~ 1", self.response);
        }
        let rhs: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "{} ~ {}", self.response, rhs.join(" + "))
    }
}

/// Borrowed view over one partition: named predictor columns plus the 0/1
/// response.
#[derive(Debug, Clone, Copy)]
pub struct ModelFrame<'a> {
    names: &'a [String],
    features: &'a DMatrix<f64>,
    response: &'a DVector<f64>,
}

impl<'a> ModelFrame<'a> {
    pub fn new(
        names: &'a [String],
        features: &'a DMatrix<f64>,
        response: &'a DVector<f64>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            features.ncols() == names.len(),
            "model frame has {} columns but {} names",
            features.ncols(),
            names.len()
        );
        anyhow::ensure!(
            features.nrows() == response.len(),
            "model frame has {} rows but {} responses",
            features.nrows(),
            response.len()
        );
        Ok(Self {
            names,
            features,
            response,
        })
    }

    pub fn nrows(&self) -> usize {
        self.features.nrows()
    }

    pub fn response(&self) -> &'a DVector<f64> {
        self.response
    }

    pub fn column(&self, name: &str) -> Result<DVector<f64>, FitError> {
        let idx = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FitError::UnknownColumn(name.to_string()))?;
        Ok(self.features.column(idx).into_owned())
    }
}
