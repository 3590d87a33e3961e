use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{AicDirection, MissingPolicy};

/// Command-line interface definition for the voice-logit CLI.
#[derive(Parser, Debug)]
#[command(
    name = "voice-logit",
    version,
    about = "Logistic-regression analysis of voice measurements for Parkinson's status"
)]
pub struct Cli {
    /// Log selection steps and stage boundaries (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: exploration, feature reduction, model selection,
    /// diagnostics and held-out evaluation.
    Analyze(AnalyzeArgs),
    /// Summarize the dataset only (missingness, class balance, distributions,
    /// correlations).
    Explore(ExploreArgs),
}

#[derive(Args, Debug, Default)]
pub struct DataArgs {
    /// Path to the CSV dataset.
    #[arg(value_name = "DATASET")]
    pub dataset: PathBuf,

    /// TOML file with analysis settings; command-line flags take precedence.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Identifier column dropped before modelling.
    #[arg(long, value_name = "COLUMN")]
    pub id_column: Option<String>,

    /// Binary (0/1) response column.
    #[arg(short, long, value_name = "COLUMN")]
    pub response: Option<String>,

    /// Policy for missing feature cells.
    #[arg(long, value_enum)]
    pub missing: Option<MissingPolicy>,

    /// Write the report to this location as well as stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Preview configuration without reading the dataset.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Default)]
pub struct ExploreArgs {
    #[command(flatten)]
    pub data: DataArgs,
}

#[derive(Args, Debug, Default)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Absolute correlation above which a feature pair is considered redundant.
    #[arg(long, value_name = "TAU")]
    pub threshold: Option<f64>,

    /// Comma-separated features to retain instead of the automatic filter.
    #[arg(long, value_name = "COLUMNS", value_delimiter = ',', num_args = 1..)]
    pub retain: Vec<String>,

    /// Comma-separated predictors whose pairwise interactions seed the
    /// likelihood-ratio search (defaults to every retained feature).
    #[arg(long, value_name = "COLUMNS", value_delimiter = ',', num_args = 1..)]
    pub interactions: Vec<String>,

    /// Significance level for likelihood-ratio and nested-model tests.
    #[arg(long, value_name = "ALPHA")]
    pub alpha: Option<f64>,

    /// Fraction of each class assigned to the training partition.
    #[arg(long, value_name = "FRACTION")]
    pub split: Option<f64>,

    /// Seed for the stratified train/test split.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stepwise AIC search direction.
    #[arg(long, value_enum)]
    pub aic_direction: Option<AicDirection>,

    /// Fit standardization statistics on the training partition only.
    #[arg(long, overrides_with = "no_scale_on_train")]
    pub scale_on_train: bool,

    /// Compute standardization statistics on the full table, even when the
    /// config file sets `scale-on-train`.
    #[arg(long, overrides_with = "scale_on_train")]
    pub no_scale_on_train: bool,

    /// VIF above which a predictor is flagged.
    #[arg(long, value_name = "BOUND")]
    pub vif_bound: Option<f64>,

    /// Studentized residual magnitude above which an observation is flagged.
    #[arg(long, value_name = "BOUND")]
    pub outlier_bound: Option<f64>,

    /// Number of largest Cook's distances to report.
    #[arg(long, value_name = "K")]
    pub top_k: Option<usize>,

    /// LOWESS span used by the logit-linearity check.
    #[arg(long, value_name = "SPAN")]
    pub span: Option<f64>,

    /// Minimum straight-line R^2 of the smoothed logit curve.
    #[arg(long, value_name = "R2")]
    pub linearity_min_r2: Option<f64>,

    /// IRLS iteration cap.
    #[arg(long, value_name = "N")]
    pub max_iterations: Option<usize>,

    /// IRLS relative deviance tolerance.
    #[arg(long, value_name = "EPS")]
    pub tolerance: Option<f64>,
}
