use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::diagnostics::{Diagnostics, Verdict};
use super::evaluate::{ConfusionMatrix, OddsRatio};
use super::preprocess::{FeatureScaling, FeatureSelection};
use super::selection::{Candidate, Comparison, PruneTrace, Selection, StepTrace};
use super::solve::LogisticFit;
use crate::config::RunConfig;
use crate::explore::{ClassBalance, ExploreReport};

const HALF_NORMAL_TAIL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSummary {
    pub rows: usize,
    pub balance: ClassBalance,
}

/// Everything produced by one `analyze` run, in stage order.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub config: RunConfig,
    pub exploration: ExploreReport,
    pub feature_selection: FeatureSelection,
    pub scaling: Vec<FeatureScaling>,
    pub train: PartitionSummary,
    pub test: PartitionSummary,
    pub candidates: Vec<Candidate>,
    pub lrt_trace: PruneTrace,
    pub aic_trace: StepTrace,
    pub choice: Selection,
    pub diagnostics: Diagnostics,
    pub odds_ratios: Vec<OddsRatio>,
    pub confusion: ConfusionMatrix,
    pub notes: Vec<String>,
}

fn format_option(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "undefined".to_string())
}

fn push_verdict(lines: &mut Vec<String>, verdict: &Verdict) {
    match verdict {
        Verdict::Pass => lines.push("  Verdict: pass".to_string()),
        Verdict::Flag(items) => {
            lines.push(format!("  Verdict: flagged ({})", items.len()));
            for item in items {
                lines.push(format!("    - {}", item));
            }
        }
    }
}

fn push_section(lines: &mut Vec<String>, title: &str) {
    lines.push(String::new());
    lines.push(format!("== {} ==", title));
}

fn push_fit_summary(lines: &mut Vec<String>, label: &str, fit: &LogisticFit) {
    lines.push(format!("[{}] {}", label, fit.formula));
    lines.push(format!(
        "  {:<28} {:>11} {:>11} {:>9} {:>10}",
        "term", "estimate", "std.error", "z", "p"
    ));
    for row in fit.coefficient_table() {
        lines.push(format!(
            "  {:<28} {:>11.5} {:>11.5} {:>9.3} {:>10.4e}",
            row.label, row.estimate, row.std_error, row.z_value, row.p_value
        ));
    }
    lines.push(format!(
        "  Null deviance {:.4} on {} df; residual deviance {:.4} on {} df; AIC {:.4}; {} IRLS iterations{}",
        fit.null_deviance,
        fit.n_obs.saturating_sub(1),
        fit.deviance,
        fit.residual_df(),
        fit.aic(),
        fit.iterations,
        if fit.boundary { " (boundary)" } else { "" }
    ));
}

impl AnalysisReport {
    pub fn final_fit(&self) -> &LogisticFit {
        &self.candidates[self.choice.chosen].fit
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!(
            "Generated at: {}",
            self.generated_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));

        push_section(&mut lines, "Configuration");
        lines.extend(self.config.summary().lines().map(str::to_string));

        push_section(&mut lines, "Data");
        lines.extend(self.exploration.render_lines());

        self.render_selection(&mut lines);
        self.render_models(&mut lines);
        self.render_diagnostics(&mut lines);
        self.render_evaluation(&mut lines);

        if !self.notes.is_empty() {
            push_section(&mut lines, "Notes");
            for note in &self.notes {
                lines.push(format!("  - {}", note));
            }
        }
        lines
    }

    fn render_selection(&self, lines: &mut Vec<String>) {
        let selection = &self.feature_selection;
        push_section(lines, "Feature selection");
        lines.push(format!(
            "Threshold |r| > {} ({})",
            selection.threshold,
            if selection.overridden {
                "retain list"
            } else {
                "greedy filter"
            }
        ));
        lines.push(format!("Removal candidates: {}", selection.candidates.join(", ")));
        lines.push(format!("Retained ({}): {}", selection.retained.len(), selection.retained.join(", ")));
        lines.push(format!("Dropped ({}): {}", selection.dropped.len(), selection.dropped.join(", ")));
        for pair in &selection.violations {
            lines.push(format!(
                "  retained pair above threshold: {} / {} (r = {:.4})",
                pair.first, pair.second, pair.r
            ));
        }

        push_section(lines, "Standardization");
        for stat in &self.scaling {
            lines.push(format!(
                "  {:<20} mean={:>12.6} sd={:>12.6}",
                stat.feature, stat.mean, stat.std_dev
            ));
        }

        push_section(lines, "Partition");
        for (name, part) in [("train", &self.train), ("test", &self.test)] {
            lines.push(format!(
                "  {:<5} {:>4} rows ({} negative / {} positive)",
                name, part.rows, part.balance.negatives, part.balance.positives
            ));
        }
    }

    fn render_models(&self, lines: &mut Vec<String>) {
        push_section(lines, "Candidate models");
        for candidate in &self.candidates {
            push_fit_summary(lines, &candidate.label, &candidate.fit);
            lines.push(String::new());
        }

        push_section(lines, "Likelihood-ratio elimination");
        lines.push(format!("Start: {}", self.lrt_trace.start));
        for (step, test) in self.lrt_trace.eliminated.iter().enumerate() {
            lines.push(format!(
                "  {:>2}. drop {:<28} chi2={:>9.4} df={} p={:.4}",
                step + 1,
                test.term.to_string(),
                test.statistic,
                test.df,
                test.p_value
            ));
        }
        lines.push(format!("Terminal: {}", self.lrt_trace.terminal));
        for test in &self.lrt_trace.terminal_tests {
            lines.push(format!(
                "  keep {:<28} chi2={:>9.4} df={} p={:.4}",
                test.term.to_string(),
                test.statistic,
                test.df,
                test.p_value
            ));
        }

        push_section(lines, "Stepwise AIC");
        lines.push(format!("Start: {}", self.aic_trace.start));
        for (step, applied) in self.aic_trace.moves.iter().enumerate() {
            lines.push(format!(
                "  {:>2}. {} {:<28} AIC {:.4} -> {:.4}",
                step + 1,
                applied.action,
                applied.term.to_string(),
                applied.aic_before,
                applied.aic_after
            ));
        }
        lines.push(format!(
            "Terminal: {} (AIC {:.4})",
            self.aic_trace.terminal, self.aic_trace.terminal_aic
        ));

        push_section(lines, "Nested comparisons");
        for comparison in &self.choice.comparisons {
            match comparison {
                Comparison::Tested {
                    smaller,
                    larger,
                    statistic,
                    df,
                    p_value,
                    prefer_smaller,
                } => lines.push(format!(
                    "  {} vs {}: deviance diff {:.4} on {} df, p={:.4} -> prefer {}",
                    smaller,
                    larger,
                    statistic,
                    df,
                    p_value,
                    if *prefer_smaller { smaller } else { larger }
                )),
                Comparison::NotApplicable {
                    first,
                    second,
                    reason,
                } => lines.push(format!("  {} vs {}: not applicable ({})", first, second, reason)),
            }
        }

        push_section(lines, "Final model");
        lines.push(format!("[{}] {}", self.choice.label, self.final_fit().formula));
        lines.push(format!("Reference model: {}", self.choice.reference));
        for exclusion in &self.choice.excluded {
            lines.push(format!("  excluded {}: {}", exclusion.label, exclusion.reason));
        }
        lines.push(format!(
            "Selection agreement (lrt vs aic): {}",
            match self.choice.agreement {
                Some(true) => "yes",
                Some(false) => "no",
                None => "n/a",
            }
        ));
    }

    fn render_diagnostics(&self, lines: &mut Vec<String>) {
        let diagnostics = &self.diagnostics;

        push_section(lines, "Diagnostics: logit linearity");
        for check in &diagnostics.linearity {
            let (first, last) = match (check.curve.first(), check.curve.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => ((f64::NAN, f64::NAN), (f64::NAN, f64::NAN)),
            };
            lines.push(format!(
                "  {:<20} R^2={:.4} slope={:>9.4} curve ({:.3}, {:.3}) .. ({:.3}, {:.3}){}",
                check.predictor,
                check.score,
                check.slope,
                first.0,
                first.1,
                last.0,
                last.1,
                if check.flagged { "  *" } else { "" }
            ));
        }
        push_verdict(lines, &diagnostics.linearity_verdict);

        let influence = &diagnostics.influence;
        push_section(lines, "Diagnostics: influence");
        lines.push(format!("Top Cook's distances (threshold 4/n = {:.4}):", influence.cooks_threshold));
        for obs in &influence.top_cooks {
            lines.push(format!("  {:<32} {:.5}", obs.label, obs.value));
        }
        lines.push(format!(
            "Observations above the Cook's threshold: {}",
            influence.high_cooks.len()
        ));
        lines.push(format!("Max leverage: {:.5}", influence.max_leverage));
        let residuals = &influence.deviance_residuals;
        lines.push(format!(
            "Deviance residuals: mean={:.4} sd={:.4} min={:.4} max={:.4}",
            residuals.mean, residuals.std_dev, residuals.min, residuals.max
        ));
        if influence.skipped > 0 {
            lines.push(format!("Skipped {} observation(s) with leverage >= 1", influence.skipped));
        }
        lines.push(format!(
            "Half-normal pairs (largest {} of {}):",
            HALF_NORMAL_TAIL.min(influence.half_normal.len()),
            influence.half_normal.len()
        ));
        let start = influence.half_normal.len().saturating_sub(HALF_NORMAL_TAIL);
        for (quantile, magnitude) in &influence.half_normal[start..] {
            lines.push(format!("  {:>8.4} {:>8.4}", quantile, magnitude));
        }
        lines.push(format!(
            "Studentized residual bound: {}",
            influence.outlier_bound
        ));
        push_verdict(lines, &diagnostics.influence_verdict);

        push_section(lines, "Diagnostics: variance inflation");
        for entry in &diagnostics.vif {
            lines.push(format!(
                "  {:<28} {:>9.4}{}",
                entry.term,
                entry.vif,
                if entry.flagged { "  *" } else { "" }
            ));
        }
        lines.push(format!("Bound: {}", diagnostics.vif_bound));
        push_verdict(lines, &diagnostics.vif_verdict);
    }

    fn render_evaluation(&self, lines: &mut Vec<String>) {
        push_section(lines, "Odds ratios (95% Wald)");
        for ratio in &self.odds_ratios {
            lines.push(format!(
                "  {:<28} {:>11.4} [{:.4}, {:.4}]",
                ratio.term, ratio.odds_ratio, ratio.lower, ratio.upper
            ));
        }

        let matrix = &self.confusion;
        let metrics = matrix.metrics();
        push_section(lines, "Held-out evaluation");
        lines.push("                 actual 1   actual 0".to_string());
        lines.push(format!(
            "  predicted 1 {:>10} {:>10}",
            matrix.true_positive, matrix.false_positive
        ));
        lines.push(format!(
            "  predicted 0 {:>10} {:>10}",
            matrix.false_negative, matrix.true_negative
        ));
        lines.push(format!("Precision: {}", format_option(metrics.precision)));
        lines.push(format!("Recall: {}", format_option(metrics.recall)));
        lines.push(format!("F1: {}", format_option(metrics.f1)));
        lines.push(format!("Accuracy: {:.4}", metrics.accuracy));
    }

    pub fn render(&self) -> String {
        self.render_lines().join("\n")
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())
            .with_context(|| format!("failed to write report to {}", path.display()))
    }
}
