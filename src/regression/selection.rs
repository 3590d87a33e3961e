//! Model selection: likelihood-ratio backward elimination, stepwise AIC and
//! pairwise nested comparisons between the resulting candidates.
//!
//! Each search is split into a pure step function and a driver loop that
//! keeps an ordered history, so single steps can be inspected in isolation.

use std::fmt;

use anyhow::{ensure, Result};

use super::distribution::chi_squared_sf;
use super::formula::{Formula, ModelFrame, Term};
use super::solve::{fit_logistic, FitError, FitOptions, LogisticFit};
use crate::AicDirection;

pub const FULL_LABEL: &str = "full";
pub const LRT_LABEL: &str = "lrt";
pub const AIC_LABEL: &str = "aic";

/// Likelihood-ratio test for removing one term from the current model.
#[derive(Debug, Clone)]
pub struct DropTest {
    pub term: Term,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub enum LrtStep {
    Eliminate {
        next: Formula,
        removed: DropTest,
        tests: Vec<DropTest>,
    },
    Halt {
        tests: Vec<DropTest>,
    },
}

#[derive(Debug, Clone)]
pub struct PruneTrace {
    pub start: Formula,
    pub eliminated: Vec<DropTest>,
    pub terminal: Formula,
    /// Removal tests evaluated against the terminal model.
    pub terminal_tests: Vec<DropTest>,
}

/// Evaluate every droppable term of `current` and remove the one with the
/// largest p-value if that p-value exceeds `alpha`.
pub fn lrt_step(
    current: &Formula,
    frame: &ModelFrame<'_>,
    options: &FitOptions,
    alpha: f64,
) -> Result<LrtStep, FitError> {
    let full = fit_logistic(current, frame, options)?;

    let mut tests = Vec::new();
    for term in current.droppable_terms() {
        let reduced = fit_logistic(&current.without(&term), frame, options)?;
        let statistic = (2.0 * (full.log_likelihood - reduced.log_likelihood)).max(0.0);
        let df = full.parameter_count() - reduced.parameter_count();
        tests.push(DropTest {
            p_value: chi_squared_sf(statistic, df as f64),
            term,
            statistic,
            df,
        });
    }

    let worst = tests
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |best, (idx, test)| match best {
            Some((_, p)) if test.p_value < p => best,
            _ => Some((idx, test.p_value)),
        });

    match worst {
        Some((idx, p_value)) if p_value > alpha => {
            let removed = tests[idx].clone();
            Ok(LrtStep::Eliminate {
                next: current.without(&removed.term),
                removed,
                tests,
            })
        }
        _ => Ok(LrtStep::Halt { tests }),
    }
}

/// Repeat `lrt_step` until no term clears the removal threshold.
pub fn prune_by_lrt(
    start: &Formula,
    frame: &ModelFrame<'_>,
    options: &FitOptions,
    alpha: f64,
) -> Result<PruneTrace, FitError> {
    let mut current = start.clone();
    let mut eliminated = Vec::new();

    loop {
        match lrt_step(&current, frame, options, alpha)? {
            LrtStep::Eliminate { next, removed, .. } => {
                log::info!(
                    "LRT step {}: removed {} (chi2 = {:.4}, df = {}, p = {:.4})",
                    eliminated.len() + 1,
                    removed.term,
                    removed.statistic,
                    removed.df,
                    removed.p_value
                );
                eliminated.push(removed);
                current = next;
            }
            LrtStep::Halt { tests } => {
                log::info!("LRT elimination halted at {}", current);
                return Ok(PruneTrace {
                    start: start.clone(),
                    eliminated,
                    terminal: current,
                    terminal_tests: tests,
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AicAction {
    Drop,
    Add,
}

impl fmt::Display for AicAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AicAction::Drop => write!(f, "-"),
            AicAction::Add => write!(f, "+"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AicMove {
    pub action: AicAction,
    pub term: Term,
    pub aic_before: f64,
    pub aic_after: f64,
}

#[derive(Debug, Clone)]
pub enum AicStep {
    Move {
        next: Formula,
        applied: AicMove,
        evaluated: Vec<AicMove>,
    },
    Halt {
        aic: f64,
        evaluated: Vec<AicMove>,
    },
}

#[derive(Debug, Clone)]
pub struct StepTrace {
    pub start: Formula,
    pub moves: Vec<AicMove>,
    pub terminal: Formula,
    pub terminal_aic: f64,
}

/// Evaluate every single-term move and apply the one with the lowest AIC if
/// it improves on the current model.
pub fn aic_step(
    current: &Formula,
    scope: &[Term],
    direction: AicDirection,
    frame: &ModelFrame<'_>,
    options: &FitOptions,
) -> Result<AicStep, FitError> {
    let aic_before = fit_logistic(current, frame, options)?.aic();

    let mut evaluated = Vec::new();
    for term in current.droppable_terms() {
        let fit = fit_logistic(&current.without(&term), frame, options)?;
        evaluated.push(AicMove {
            action: AicAction::Drop,
            term,
            aic_before,
            aic_after: fit.aic(),
        });
    }
    if direction == AicDirection::Both {
        for term in current.addable_terms(scope) {
            let fit = fit_logistic(&current.with(term.clone()), frame, options)?;
            evaluated.push(AicMove {
                action: AicAction::Add,
                term,
                aic_before,
                aic_after: fit.aic(),
            });
        }
    }

    let best = evaluated
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |best, (idx, candidate)| match best {
            Some((_, aic)) if candidate.aic_after >= aic => best,
            _ => Some((idx, candidate.aic_after)),
        });

    match best {
        Some((idx, aic_after)) if aic_after < aic_before => {
            let applied = evaluated[idx].clone();
            let next = match applied.action {
                AicAction::Drop => current.without(&applied.term),
                AicAction::Add => current.with(applied.term.clone()),
            };
            Ok(AicStep::Move {
                next,
                applied,
                evaluated,
            })
        }
        _ => Ok(AicStep::Halt {
            aic: aic_before,
            evaluated,
        }),
    }
}

pub fn stepwise_aic(
    start: &Formula,
    scope: &[Term],
    direction: AicDirection,
    frame: &ModelFrame<'_>,
    options: &FitOptions,
) -> Result<StepTrace, FitError> {
    let mut current = start.clone();
    let mut visited = vec![start.clone()];
    let mut moves = Vec::new();

    loop {
        match aic_step(&current, scope, direction, frame, options)? {
            AicStep::Move { next, applied, .. } => {
                if visited.iter().any(|f| f.same_terms(&next)) {
                    log::info!("Stepwise AIC revisited a model; stopping at {}", current);
                    let terminal_aic = applied.aic_before;
                    return Ok(StepTrace {
                        start: start.clone(),
                        moves,
                        terminal: current,
                        terminal_aic,
                    });
                }
                log::info!(
                    "AIC step {}: {} {} (AIC {:.4} -> {:.4})",
                    moves.len() + 1,
                    applied.action,
                    applied.term,
                    applied.aic_before,
                    applied.aic_after
                );
                visited.push(next.clone());
                moves.push(applied);
                current = next;
            }
            AicStep::Halt { aic, .. } => {
                log::info!("Stepwise AIC halted at {} (AIC {:.4})", current, aic);
                return Ok(StepTrace {
                    start: start.clone(),
                    moves,
                    terminal: current,
                    terminal_aic: aic,
                });
            }
        }
    }
}

/// A fitted model under consideration for the final choice.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub label: String,
    pub fit: LogisticFit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Tested {
        smaller: String,
        larger: String,
        statistic: f64,
        df: usize,
        p_value: f64,
        prefer_smaller: bool,
    },
    NotApplicable {
        first: String,
        second: String,
        reason: String,
    },
}

/// Deviance-difference chi-squared test between two nested fits. Argument
/// order does not matter; the model with fewer parameters is the null.
pub fn compare_nested(a: &Candidate, b: &Candidate, alpha: f64) -> Comparison {
    let not_applicable = |reason: &str| Comparison::NotApplicable {
        first: a.label.clone(),
        second: b.label.clone(),
        reason: reason.to_string(),
    };

    let (smaller, larger) = if a.fit.parameter_count() <= b.fit.parameter_count() {
        (a, b)
    } else {
        (b, a)
    };

    if smaller.fit.n_obs != larger.fit.n_obs {
        return not_applicable("models were fit on different observations");
    }
    if !smaller.fit.formula.is_nested_in(&larger.fit.formula) {
        return not_applicable("models are not nested");
    }
    let df = smaller.fit.residual_df() - larger.fit.residual_df();
    if df == 0 {
        return not_applicable("zero degrees-of-freedom difference");
    }

    let statistic = (smaller.fit.deviance - larger.fit.deviance).max(0.0);
    let p_value = chi_squared_sf(statistic, df as f64);

    Comparison::Tested {
        smaller: smaller.label.clone(),
        larger: larger.label.clone(),
        statistic,
        df,
        p_value,
        prefer_smaller: p_value >= alpha,
    }
}

/// A candidate left out of the final choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub comparisons: Vec<Comparison>,
    pub chosen: usize,
    pub label: String,
    /// Label of the model every other candidate must be tested against.
    pub reference: String,
    pub excluded: Vec<Exclusion>,
    /// Whether the candidates labelled `lrt` and `aic` share a term set.
    pub agreement: Option<bool>,
}

fn accepted_against(comparisons: &[Comparison], candidate: &str, larger_label: &str) -> bool {
    comparisons.iter().any(|c| {
        matches!(c, Comparison::Tested { smaller, larger, prefer_smaller: true, .. }
            if smaller == candidate && larger == larger_label)
    })
}

fn rejection<'a>(comparisons: &'a [Comparison], candidate: &str) -> Option<&'a Comparison> {
    comparisons.iter().find(|c| {
        matches!(c, Comparison::Tested { smaller, prefer_smaller: false, .. } if smaller == candidate)
    })
}

fn pairing<'a>(comparisons: &'a [Comparison], a: &str, b: &str) -> Option<&'a Comparison> {
    comparisons.iter().find(|c| match c {
        Comparison::Tested { smaller, larger, .. } => {
            (smaller == a && larger == b) || (smaller == b && larger == a)
        }
        Comparison::NotApplicable { first, second, .. } => {
            (first == a && second == b) || (first == b && second == a)
        }
    })
}

/// Compare every pair of candidates and choose the smallest model that is
/// linked to the reference (the `full` candidate, or the first one) by a
/// chain of accepted nested tests and that no tested comparison rejects.
/// A candidate with the same terms as an eligible model is eligible too.
/// The reference itself is always eligible. Ties go to the earlier candidate.
pub fn select_final(candidates: &[Candidate], alpha: f64) -> Result<Selection> {
    ensure!(!candidates.is_empty(), "no candidate models to select from");
    for (i, candidate) in candidates.iter().enumerate() {
        ensure!(
            candidates[..i].iter().all(|c| c.label != candidate.label),
            "duplicate candidate label '{}'",
            candidate.label
        );
    }

    let mut comparisons = Vec::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            comparisons.push(compare_nested(&candidates[i], &candidates[j], alpha));
        }
    }

    let reference = candidates
        .iter()
        .position(|c| c.label == FULL_LABEL)
        .unwrap_or(0);

    let mut eligible = vec![false; candidates.len()];
    eligible[reference] = true;
    loop {
        let mut changed = false;
        for i in 0..candidates.len() {
            if eligible[i] {
                continue;
            }
            let reached = (0..candidates.len()).filter(|&j| eligible[j]).any(|j| {
                let (this, other) = (&candidates[i], &candidates[j]);
                (this.fit.n_obs == other.fit.n_obs
                    && this.fit.formula.same_terms(&other.fit.formula))
                    || accepted_against(&comparisons, &this.label, &other.label)
            });
            if reached {
                eligible[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let reference_label = &candidates[reference].label;
    let mut excluded = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        if i == reference {
            continue;
        }
        let reason = match rejection(&comparisons, &candidate.label) {
            Some(Comparison::Tested { larger, p_value, .. }) => {
                format!("rejected against '{}' (p = {:.4})", larger, p_value)
            }
            _ if eligible[i] => continue,
            _ => match pairing(&comparisons, &candidate.label, reference_label) {
                Some(Comparison::NotApplicable { reason, .. }) => {
                    format!("not tested against '{}': {}", reference_label, reason)
                }
                Some(Comparison::Tested { smaller, .. }) if smaller == reference_label => {
                    format!("extends the '{}' model", reference_label)
                }
                _ => format!("no accepted nested test links it to '{}'", reference_label),
            },
        };
        log::warn!("Candidate '{}' excluded from the final choice: {}", candidate.label, reason);
        excluded.push(Exclusion {
            label: candidate.label.clone(),
            reason,
        });
    }

    let chosen = candidates
        .iter()
        .enumerate()
        .filter(|(idx, c)| *idx == reference || excluded.iter().all(|e| e.label != c.label))
        .min_by_key(|(idx, c)| (c.fit.parameter_count(), *idx))
        .map(|(idx, _)| idx)
        .unwrap_or(reference);

    let find = |label: &str| candidates.iter().find(|c| c.label == label);
    let agreement = match (find(LRT_LABEL), find(AIC_LABEL)) {
        (Some(lrt), Some(aic)) => Some(lrt.fit.formula.same_terms(&aic.fit.formula)),
        _ => None,
    };

    log::info!(
        "Selected candidate '{}': {}",
        candidates[chosen].label,
        candidates[chosen].fit.formula
    );

    Ok(Selection {
        comparisons,
        chosen,
        label: candidates[chosen].label.clone(),
        reference: reference_label.clone(),
        excluded,
        agreement,
    })
}
