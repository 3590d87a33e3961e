use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AnalyzeArgs, DataArgs, ExploreArgs};
use crate::regression::diagnostics::DiagnosticOptions;
use crate::regression::solve::{FitOptions, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE};
use crate::{AicDirection, MissingPolicy};

pub const DEFAULT_ID_COLUMN: &str = "name";
pub const DEFAULT_RESPONSE: &str = "status";
pub const DEFAULT_CORRELATION_THRESHOLD: f64 = 0.6;
pub const DEFAULT_ALPHA: f64 = 0.05;
pub const DEFAULT_SPLIT_FRACTION: f64 = 0.8;
pub const DEFAULT_SEED: u64 = 225;
pub const DEFAULT_VIF_BOUND: f64 = 5.0;
pub const DEFAULT_OUTLIER_BOUND: f64 = 3.0;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_LOWESS_SPAN: f64 = 2.0 / 3.0;
pub const DEFAULT_LINEARITY_MIN_R2: f64 = 0.9;

/// Settings read from a `--config` TOML file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub id_column: Option<String>,
    pub response: Option<String>,
    pub missing: Option<MissingPolicy>,
    pub threshold: Option<f64>,
    pub retain: Option<Vec<String>>,
    pub interactions: Option<Vec<String>>,
    pub alpha: Option<f64>,
    pub split: Option<f64>,
    pub seed: Option<u64>,
    pub aic_direction: Option<AicDirection>,
    pub scale_on_train: Option<bool>,
    pub vif_bound: Option<f64>,
    pub outlier_bound: Option<f64>,
    pub top_k: Option<usize>,
    pub span: Option<f64>,
    pub linearity_min_r2: Option<f64>,
    pub max_iterations: Option<usize>,
    pub tolerance: Option<f64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("{}: invalid analysis configuration", path.display()))
    }
}

/// Runtime configuration compiled from CLI input and an optional TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: PathBuf,
    pub id_column: String,
    pub response: String,
    pub missing_policy: MissingPolicy,
    pub correlation_threshold: f64,
    pub retain: Vec<String>,
    pub interaction_predictors: Vec<String>,
    pub alpha: f64,
    pub split_fraction: f64,
    pub seed: u64,
    pub aic_direction: AicDirection,
    pub scale_on_train: bool,
    pub vif_bound: f64,
    pub outlier_bound: f64,
    pub influence_top_k: usize,
    pub lowess_span: f64,
    pub linearity_min_r2: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub output: Option<PathBuf>,
    pub dry_run: bool,
}

fn pick_list(cli: Vec<String>, file: Option<Vec<String>>) -> Vec<String> {
    if cli.is_empty() {
        file.unwrap_or_default()
    } else {
        cli
    }
}

impl RunConfig {
    /// Built-in defaults for `dataset`.
    pub fn for_dataset(dataset: impl Into<PathBuf>) -> Self {
        Self {
            dataset: dataset.into(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            response: DEFAULT_RESPONSE.to_string(),
            missing_policy: MissingPolicy::Reject,
            correlation_threshold: DEFAULT_CORRELATION_THRESHOLD,
            retain: Vec::new(),
            interaction_predictors: Vec::new(),
            alpha: DEFAULT_ALPHA,
            split_fraction: DEFAULT_SPLIT_FRACTION,
            seed: DEFAULT_SEED,
            aic_direction: AicDirection::Backward,
            scale_on_train: false,
            vif_bound: DEFAULT_VIF_BOUND,
            outlier_bound: DEFAULT_OUTLIER_BOUND,
            influence_top_k: DEFAULT_TOP_K,
            lowess_span: DEFAULT_LOWESS_SPAN,
            linearity_min_r2: DEFAULT_LINEARITY_MIN_R2,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            output: None,
            dry_run: false,
        }
    }

    fn from_data_args(data: DataArgs) -> Result<(Self, FileConfig)> {
        let file = match &data.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let mut config = Self::for_dataset(data.dataset);
        if let Some(id) = data.id_column.or_else(|| file.id_column.clone()) {
            config.id_column = id;
        }
        if let Some(response) = data.response.or_else(|| file.response.clone()) {
            config.response = response;
        }
        if let Some(policy) = data.missing.or(file.missing) {
            config.missing_policy = policy;
        }
        config.output = data.output;
        config.dry_run = data.dry_run;

        Ok((config, file))
    }

    pub fn from_explore_args(args: ExploreArgs) -> Result<Self> {
        Self::from_data_args(args.data).map(|(config, _)| config)
    }

    /// Command-line values win over the file, the file over built-in defaults.
    pub fn from_analyze_args(args: AnalyzeArgs) -> Result<Self> {
        let (mut config, file) = Self::from_data_args(args.data)?;

        config.retain = pick_list(args.retain, file.retain);
        config.interaction_predictors = pick_list(args.interactions, file.interactions);
        let scale_flag = if args.no_scale_on_train {
            Some(false)
        } else if args.scale_on_train {
            Some(true)
        } else {
            None
        };
        config.scale_on_train = scale_flag.or(file.scale_on_train).unwrap_or(false);

        if let Some(v) = args.threshold.or(file.threshold) {
            config.correlation_threshold = v;
        }
        if let Some(v) = args.alpha.or(file.alpha) {
            config.alpha = v;
        }
        if let Some(v) = args.split.or(file.split) {
            config.split_fraction = v;
        }
        if let Some(v) = args.seed.or(file.seed) {
            config.seed = v;
        }
        if let Some(v) = args.aic_direction.or(file.aic_direction) {
            config.aic_direction = v;
        }
        if let Some(v) = args.vif_bound.or(file.vif_bound) {
            config.vif_bound = v;
        }
        if let Some(v) = args.outlier_bound.or(file.outlier_bound) {
            config.outlier_bound = v;
        }
        if let Some(v) = args.top_k.or(file.top_k) {
            config.influence_top_k = v;
        }
        if let Some(v) = args.span.or(file.span) {
            config.lowess_span = v;
        }
        if let Some(v) = args.linearity_min_r2.or(file.linearity_min_r2) {
            config.linearity_min_r2 = v;
        }
        if let Some(v) = args.max_iterations.or(file.max_iterations) {
            config.max_iterations = v;
        }
        if let Some(v) = args.tolerance.or(file.tolerance) {
            config.tolerance = v;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.response.trim().is_empty(),
            "response column must be provided"
        );
        ensure!(
            self.id_column != self.response,
            "identifier and response columns must differ (both '{}')",
            self.response
        );
        ensure!(
            self.correlation_threshold > 0.0 && self.correlation_threshold <= 1.0,
            "correlation threshold must lie in (0, 1], got {}",
            self.correlation_threshold
        );
        ensure!(
            self.alpha > 0.0 && self.alpha < 1.0,
            "significance level must lie in (0, 1), got {}",
            self.alpha
        );
        ensure!(
            self.split_fraction > 0.0 && self.split_fraction < 1.0,
            "split fraction must lie in (0, 1), got {}",
            self.split_fraction
        );
        ensure!(
            self.lowess_span > 0.0 && self.lowess_span <= 1.0,
            "lowess span must lie in (0, 1], got {}",
            self.lowess_span
        );
        ensure!(self.vif_bound >= 1.0, "VIF bound must be at least 1");
        ensure!(self.outlier_bound > 0.0, "outlier bound must be positive");
        ensure!(self.max_iterations > 0, "IRLS needs at least one iteration");
        ensure!(self.tolerance > 0.0, "IRLS tolerance must be positive");

        for (label, list) in [
            ("retain", &self.retain),
            ("interactions", &self.interaction_predictors),
        ] {
            let mut seen = HashSet::new();
            for name in list {
                ensure!(
                    seen.insert(name),
                    "{} list names '{}' more than once",
                    label,
                    name
                );
                ensure!(
                    name != &self.response && name != &self.id_column,
                    "{} list may not include the '{}' column",
                    label,
                    name
                );
            }
        }

        if !self.retain.is_empty() {
            for name in &self.interaction_predictors {
                ensure!(
                    self.retain.contains(name),
                    "interaction predictor '{}' is not in the retain list",
                    name
                );
            }
        }

        if !self.dry_run && !self.dataset.exists() {
            bail!(
                "Dataset '{}' does not exist; use --dry-run to preview without the file",
                self.dataset.display()
            );
        }

        Ok(())
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }

    pub fn diagnostic_options(&self) -> DiagnosticOptions {
        DiagnosticOptions {
            lowess_span: self.lowess_span,
            linearity_min_r2: self.linearity_min_r2,
            influence_top_k: self.influence_top_k,
            outlier_bound: self.outlier_bound,
            vif_bound: self.vif_bound,
        }
    }

    pub fn summary(&self) -> String {
        let list = |names: &[String], empty: &str| {
            if names.is_empty() {
                empty.to_string()
            } else {
                names.join(", ")
            }
        };

        format!(
            concat!(
                "Dataset: {}\n",
                "Identifier column: {}\n",
                "Response: {}\n",
                "Missing values: {}\n",
                "Correlation threshold: {}\n",
                "Retained features: {}\n",
                "Interaction predictors: {}\n",
                "Significance level: {}\n",
                "Split: {} train fraction, seed {}\n",
                "Stepwise AIC: {}\n",
                "Standardization: {}\n",
                "Diagnostics: VIF > {}, |studentized| > {}, top {} Cook's, lowess span {:.3}, linearity R^2 < {}\n",
                "IRLS: max {} iterations, tolerance {:e}"
            ),
            self.dataset.display(),
            self.id_column,
            self.response,
            self.missing_policy,
            self.correlation_threshold,
            list(&self.retain, "automatic"),
            list(&self.interaction_predictors, "all retained features"),
            self.alpha,
            self.split_fraction,
            self.seed,
            self.aic_direction,
            if self.scale_on_train {
                "fit on training partition"
            } else {
                "fit on full table before split"
            },
            self.vif_bound,
            self.outlier_bound,
            self.influence_top_k,
            self.lowess_span,
            self.linearity_min_r2,
            self.max_iterations,
            self.tolerance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::io::Write;

    fn analyze_args(dataset: &str) -> AnalyzeArgs {
        AnalyzeArgs {
            data: DataArgs {
                dataset: PathBuf::from(dataset),
                dry_run: true,
                ..DataArgs::default()
            },
            ..AnalyzeArgs::default()
        }
    }

    #[test]
    fn defaults_match_reference_analysis() {
        let config = RunConfig::from_analyze_args(analyze_args("data.csv")).expect("config");
        assert_eq!(config.seed, 225);
        assert_eq!(config.split_fraction, 0.8);
        assert_eq!(config.correlation_threshold, 0.6);
        assert_eq!(config.alpha, 0.05);
        assert_eq!(config.id_column, "name");
        assert_eq!(config.response, "status");
        assert_eq!(config.aic_direction, AicDirection::Backward);
        assert!(config.retain.is_empty());
        config.validate().expect("valid dry-run config");
    }

    #[test]
    fn file_values_fill_gaps_and_flags_take_precedence() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "threshold = 0.7\nseed = 1\nretain = [\"a\", \"b\"]\naic-direction = \"both\"\nmissing = \"impute-mean\""
        )
        .expect("write");

        let mut args = analyze_args("data.csv");
        args.data.config = Some(file.path().to_path_buf());
        args.seed = Some(99);

        let config = RunConfig::from_analyze_args(args).expect("config");
        assert_eq!(config.correlation_threshold, 0.7);
        assert_eq!(config.seed, 99);
        assert_eq!(config.retain, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.aic_direction, AicDirection::Both);
        assert_eq!(config.missing_policy, MissingPolicy::ImputeMean);
    }

    #[test]
    fn scale_on_train_from_file_can_be_switched_off() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "scale-on-train = true").expect("write");

        let mut args = analyze_args("data.csv");
        args.data.config = Some(file.path().to_path_buf());
        let config = RunConfig::from_analyze_args(args).expect("config");
        assert!(config.scale_on_train);

        let mut args = analyze_args("data.csv");
        args.data.config = Some(file.path().to_path_buf());
        args.no_scale_on_train = true;
        let config = RunConfig::from_analyze_args(args).expect("config");
        assert!(!config.scale_on_train);
    }

    #[test]
    fn later_scale_flag_wins_on_the_command_line() {
        let cli = Cli::try_parse_from([
            "voice-logit",
            "analyze",
            "data.csv",
            "--scale-on-train",
            "--no-scale-on-train",
        ])
        .expect("parse");
        let Commands::Analyze(args) = cli.command else {
            panic!("expected the analyze command");
        };
        assert!(!args.scale_on_train);
        assert!(args.no_scale_on_train);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "treshold = 0.7").expect("write");
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_settings() {
        let mut config = RunConfig::for_dataset("data.csv");
        config.dry_run = true;

        config.split_fraction = 1.0;
        assert!(config.validate().is_err());
        config.split_fraction = 0.8;

        config.retain = vec!["a".into(), "a".into()];
        assert!(config.validate().is_err());

        config.retain = vec!["a".into()];
        config.interaction_predictors = vec!["b".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not in the retain list"));
    }

    #[test]
    fn validate_requires_dataset_unless_dry_run() {
        let config = RunConfig::for_dataset("/definitely/not/here.csv");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn summary_mentions_key_settings() {
        let summary = RunConfig::for_dataset("voice.csv").summary();
        assert!(summary.contains("Dataset: voice.csv"));
        assert!(summary.contains("seed 225"));
        assert!(summary.contains("Retained features: automatic"));
    }
}
