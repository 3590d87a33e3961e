pub mod diagnostics;
pub mod distribution;
pub mod evaluate;
pub mod formula;
pub mod preprocess;
mod report;
pub mod selection;
pub mod solve;

#[cfg(test)]
pub(crate) mod test_fixtures;

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use nalgebra::{DMatrix, DVector};

use crate::config::RunConfig;
use crate::data::Dataset;
use crate::explore::{self, ClassBalance};

use diagnostics::run_diagnostics;
use evaluate::{
    confusion_matrix, odds_ratios, DEFAULT_CLASSIFICATION_THRESHOLD, DEFAULT_CONFIDENCE_LEVEL,
};
use formula::{pairwise_interactions, Formula, ModelFrame};
use preprocess::{apply_scaling, compute_feature_scaling, reduce_features, stratified_split};
use selection::{prune_by_lrt, select_final, stepwise_aic, Candidate};
use solve::{fit_logistic, predict_probabilities};

pub use report::{AnalysisReport, PartitionSummary};
pub use selection::{AIC_LABEL, FULL_LABEL, LRT_LABEL};

/// Owned rows of one partition, standardized, with observation labels.
struct PartitionData {
    features: DMatrix<f64>,
    response: DVector<f64>,
    labels: Vec<String>,
}

impl PartitionData {
    fn take(features: &DMatrix<f64>, dataset: &Dataset, rows: &[usize]) -> Self {
        Self {
            features: features.select_rows(rows.iter()),
            response: DVector::from_iterator(
                rows.len(),
                rows.iter().map(|&r| f64::from(dataset.response[r])),
            ),
            labels: rows
                .iter()
                .map(|&r| format!("row {} ({})", r + 1, dataset.ids[r]))
                .collect(),
        }
    }

    fn summary(&self) -> PartitionSummary {
        let positives = self.response.iter().filter(|&&y| y > 0.5).count();
        PartitionSummary {
            rows: self.response.len(),
            balance: ClassBalance {
                negatives: self.response.len() - positives,
                positives,
            },
        }
    }
}

fn interaction_predictors(config: &RunConfig, retained: &[String]) -> Result<Vec<String>> {
    if config.interaction_predictors.is_empty() {
        return Ok(retained.to_vec());
    }
    for name in &config.interaction_predictors {
        ensure!(
            retained.contains(name),
            "interaction predictor '{}' was not retained by feature reduction",
            name
        );
    }
    // Keep dataset column order so term order does not depend on flag order.
    Ok(retained
        .iter()
        .filter(|name| config.interaction_predictors.contains(name))
        .cloned()
        .collect())
}

/// Run every stage: ingestion, exploration, feature reduction, partitioning,
/// model selection, diagnostics and held-out evaluation.
pub fn run_analysis(config: &RunConfig) -> Result<AnalysisReport> {
    let (dataset, exploration) = explore::run_exploration(config)?;
    ensure!(
        exploration.balance.negatives > 0 && exploration.balance.positives > 0,
        "response '{}' must contain both classes (found {} negative / {} positive)",
        config.response,
        exploration.balance.negatives,
        exploration.balance.positives
    );

    let feature_selection = reduce_features(
        &exploration.correlation,
        config.correlation_threshold,
        &config.retain,
    )?;
    let retained = feature_selection.retained.clone();

    let interacting = interaction_predictors(config, &retained)?;

    let partition = stratified_split(&dataset.response, config.split_fraction, config.seed)?;

    let raw = dataset.select_columns(&retained)?;
    let scaling = if config.scale_on_train {
        compute_feature_scaling(&raw.select_rows(partition.train.iter()), &retained)?
    } else {
        log::warn!("Standardization statistics use the full table, including held-out rows");
        compute_feature_scaling(&raw, &retained)?
    };
    let scaled = apply_scaling(raw, &scaling);

    let train = PartitionData::take(&scaled, &dataset, &partition.train);
    let test = PartitionData::take(&scaled, &dataset, &partition.test);
    let train_frame = ModelFrame::new(&retained, &train.features, &train.response)?;
    let test_frame = ModelFrame::new(&retained, &test.features, &test.response)?;

    let options = config.fit_options();
    let additive = Formula::additive(&config.response, &retained);
    let saturated = Formula::with_pairwise_interactions(&config.response, &retained, &interacting);

    let lrt_trace = prune_by_lrt(&saturated, &train_frame, &options, config.alpha)
        .context("likelihood-ratio elimination failed")?;

    let scope = pairwise_interactions(&retained);
    let aic_trace = stepwise_aic(
        &additive,
        &scope,
        config.aic_direction,
        &train_frame,
        &options,
    )
    .context("stepwise AIC search failed")?;

    let mut candidates = Vec::with_capacity(3);
    for (label, formula) in [
        (FULL_LABEL, &additive),
        (LRT_LABEL, &lrt_trace.terminal),
        (AIC_LABEL, &aic_trace.terminal),
    ] {
        let fit = fit_logistic(formula, &train_frame, &options)
            .with_context(|| format!("failed to fit the '{}' model {}", label, formula))?;
        candidates.push(Candidate {
            label: label.to_string(),
            fit,
        });
    }

    let choice = select_final(&candidates, config.alpha)?;
    let final_fit = &candidates[choice.chosen].fit;

    let diagnostics = run_diagnostics(
        final_fit,
        &train_frame,
        &train.labels,
        &config.diagnostic_options(),
    )
    .context("diagnostics on the final model failed")?;

    let odds = odds_ratios(final_fit, DEFAULT_CONFIDENCE_LEVEL)?;
    let probabilities = predict_probabilities(final_fit, &test_frame)
        .context("failed to score the held-out partition")?;
    let confusion = confusion_matrix(
        &test.response,
        &probabilities,
        DEFAULT_CLASSIFICATION_THRESHOLD,
    )?;
    log::info!(
        "Held-out evaluation on {} rows: accuracy {:.4}",
        confusion.total(),
        confusion.metrics().accuracy
    );

    let mut notes = Vec::new();
    if config.scale_on_train {
        notes.push(
            "Standardization statistics were fit on the training partition and applied to both partitions."
                .to_string(),
        );
    } else {
        notes.push(
            "Standardization statistics were computed on the full table before splitting; held-out rows influence training-time scaling."
                .to_string(),
        );
    }
    for count in &dataset.imputed {
        notes.push(format!(
            "Column '{}' had {} missing value(s) replaced by the column mean.",
            count.column, count.missing
        ));
    }
    if !feature_selection.violations.is_empty() {
        notes.push(format!(
            "The retain list keeps {} feature pair(s) above |r| = {}.",
            feature_selection.violations.len(),
            config.correlation_threshold
        ));
    }
    for candidate in candidates.iter().filter(|c| c.fit.boundary) {
        notes.push(format!(
            "Model '{}' has fitted probabilities numerically 0 or 1; its standard errors are unreliable.",
            candidate.label
        ));
    }
    for exclusion in &choice.excluded {
        notes.push(format!(
            "Candidate '{}' was excluded from the final choice: {}.",
            exclusion.label, exclusion.reason
        ));
    }
    if choice.agreement == Some(false) {
        notes.push(
            "The likelihood-ratio and AIC searches ended at different models.".to_string(),
        );
    }

    Ok(AnalysisReport {
        generated_at: Utc::now(),
        config: config.clone(),
        exploration,
        feature_selection,
        scaling,
        train: train.summary(),
        test: test.summary(),
        candidates,
        lrt_trace,
        aic_trace,
        choice,
        diagnostics,
        odds_ratios: odds,
        confusion,
        notes,
    })
}
