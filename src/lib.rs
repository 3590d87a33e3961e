mod cli;
pub mod config;
pub mod data;
pub mod explore;
pub mod regression;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use cli::{AnalyzeArgs, Cli, Commands, ExploreArgs};

/// Search direction for stepwise AIC selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AicDirection {
    Backward,
    Both,
}

impl AicDirection {
    pub fn label(self) -> &'static str {
        match self {
            AicDirection::Backward => "backward elimination",
            AicDirection::Both => "bidirectional (drop or add pairwise interactions)",
        }
    }
}

impl std::fmt::Display for AicDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// What to do when feature cells are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingPolicy {
    Reject,
    ImputeMean,
}

impl MissingPolicy {
    pub fn label(self) -> &'static str {
        match self {
            MissingPolicy::Reject => "reject incomplete datasets",
            MissingPolicy::ImputeMean => "impute column means",
        }
    }
}

impl std::fmt::Display for MissingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Analyze(args) => handle_analyze(args),
        Commands::Explore(args) => handle_explore(args),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .try_init();
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let config = config::RunConfig::from_analyze_args(args)?;
    config.validate()?;

    println!("--> Configuration\n{}", config.summary());

    if config.dry_run {
        println!("\nDry run requested: skipping model fitting.");
        return Ok(());
    }

    let report = regression::run_analysis(&config)?;
    println!("\n--> Report\n{}", report.render());

    if let Some(path) = &config.output {
        report.persist(path)?;
        println!("\nReport written to {}", path.display());
    }

    Ok(())
}

fn handle_explore(args: ExploreArgs) -> Result<()> {
    let config = config::RunConfig::from_explore_args(args)?;
    config.validate()?;

    println!("--> Configuration\n{}", config.summary());

    if config.dry_run {
        println!("\nDry run requested: skipping data exploration.");
        return Ok(());
    }

    let (_, report) = explore::run_exploration(&config)?;
    println!("\n--> Exploration\n{}", report.render());

    if let Some(path) = &config.output {
        report.persist(path)?;
        println!("\nReport written to {}", path.display());
    }

    Ok(())
}
