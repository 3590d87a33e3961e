use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tempfile::TempDir;

use voice_logit::config::{FileConfig, RunConfig};
use voice_logit::explore::run_exploration;
use voice_logit::regression::preprocess::reduce_features;
use voice_logit::regression::{run_analysis, AIC_LABEL, FULL_LABEL, LRT_LABEL};
use voice_logit::MissingPolicy;

const NEGATIVES: usize = 48;
const POSITIVES: usize = 147;

const RETAINED: [&str; 7] = [
    "MDVP:Fo(Hz)",
    "MDVP:Fhi(Hz)",
    "MDVP:Flo(Hz)",
    "RPDE",
    "DFA",
    "spread2",
    "D2",
];

const HEADER: [&str; 13] = [
    "name",
    "MDVP:Fo(Hz)",
    "MDVP:Fhi(Hz)",
    "MDVP:Flo(Hz)",
    "MDVP:Jitter(%)",
    "MDVP:Shimmer",
    "NHR",
    "status",
    "RPDE",
    "DFA",
    "spread2",
    "D2",
    "PPE",
];

fn normal(mean: f64, sd: f64) -> Normal<f64> {
    Normal::new(mean, sd).expect("valid normal parameters")
}

/// Voice-like table with 48 healthy and 147 affected recordings. The jitter
/// family and PPE/spread2 are strongly correlated so the filter has work to
/// do; class shifts are moderate so no model separates the data.
fn write_voice_csv(dir: &Path, seed: u64) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut status: Vec<u8> = std::iter::repeat(0)
        .take(NEGATIVES)
        .chain(std::iter::repeat(1).take(POSITIVES))
        .collect();
    status.shuffle(&mut rng);

    let noise = normal(0.0, 1.0);
    let path = dir.join("voice.csv");
    let mut writer = csv::Writer::from_path(&path).expect("create csv");
    writer.write_record(HEADER).expect("header");

    for (row, &y) in status.iter().enumerate() {
        let s = f64::from(y);
        let fo = 190.0 - 25.0 * s + 40.0 * noise.sample(&mut rng);
        let fhi = fo + 60.0 + 45.0 * noise.sample(&mut rng).abs();
        let flo = 0.5 * fo + 35.0 * noise.sample(&mut rng);
        let jitter = (-5.6 + 0.35 * s + 0.45 * noise.sample(&mut rng)).exp();
        let shimmer = 4.5 * jitter + 0.002 * noise.sample(&mut rng);
        let nhr = 3.0 * jitter + 0.001 * noise.sample(&mut rng);
        let rpde = 0.45 + 0.05 * s + 0.1 * noise.sample(&mut rng);
        let dfa = 0.70 + 0.02 * s + 0.05 * noise.sample(&mut rng);
        let spread2 = 0.20 + 0.05 * s + 0.08 * noise.sample(&mut rng);
        let d2 = 2.30 + 0.15 * s + 0.35 * noise.sample(&mut rng);
        let ppe = 0.05 + 0.8 * spread2 + 0.02 * noise.sample(&mut rng);

        let record = [
            format!("phon_R01_S{:02}_{}", row / 6 + 1, row % 6 + 1),
            fo.to_string(),
            fhi.to_string(),
            flo.to_string(),
            jitter.to_string(),
            shimmer.to_string(),
            nhr.to_string(),
            y.to_string(),
            rpde.to_string(),
            dfa.to_string(),
            spread2.to_string(),
            d2.to_string(),
            ppe.to_string(),
        ];
        writer.write_record(&record).expect("record");
    }
    writer.flush().expect("flush");
    path
}

fn reference_config(dataset: PathBuf) -> RunConfig {
    let mut config = RunConfig::for_dataset(dataset);
    config.retain = RETAINED.iter().map(|s| s.to_string()).collect();
    config.interaction_predictors = vec![
        "MDVP:Fo(Hz)".to_string(),
        "RPDE".to_string(),
        "spread2".to_string(),
    ];
    config
}

#[test]
fn analysis_runs_end_to_end_with_retain_override() {
    let dir = TempDir::new().expect("tempdir");
    let config = reference_config(write_voice_csv(dir.path(), 7));
    config.validate().expect("valid config");

    let report = run_analysis(&config).expect("analysis");

    assert_eq!(report.exploration.rows, NEGATIVES + POSITIVES);
    assert_eq!(report.feature_selection.retained.len(), 7);
    assert!(report.feature_selection.overridden);
    assert_eq!(report.scaling.len(), 7);

    assert_eq!(report.train.rows, 157);
    assert_eq!(report.test.rows, 38);
    assert_eq!(report.train.balance.negatives, 39);
    assert_eq!(report.test.balance.negatives, 9);
    assert_eq!(report.confusion.total(), report.test.rows);

    let labels: Vec<&str> = report.candidates.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec![FULL_LABEL, LRT_LABEL, AIC_LABEL]);
    for candidate in &report.candidates {
        assert_eq!(candidate.fit.n_obs, 157);
    }
    // The full model has three pairs of interacting predictors to start from.
    assert_eq!(report.lrt_trace.start.terms().len(), 10);
    assert_eq!(report.aic_trace.start.terms().len(), 7);

    let final_fit = report.final_fit();
    assert_eq!(report.odds_ratios.len(), final_fit.parameter_count());
    assert_eq!(report.diagnostics.vif.len(), final_fit.parameter_count() - 1);
    assert!(report.diagnostics.influence.top_cooks.len() <= config.influence_top_k);

    let rendered = report.render();
    for section in [
        "== Configuration ==",
        "== Feature selection ==",
        "== Partition ==",
        "== Candidate models ==",
        "== Likelihood-ratio elimination ==",
        "== Stepwise AIC ==",
        "== Nested comparisons ==",
        "== Final model ==",
        "== Diagnostics: variance inflation ==",
        "== Held-out evaluation ==",
    ] {
        assert!(rendered.contains(section), "missing section {}", section);
    }
    assert!(rendered.contains("computed on the full table before splitting"));
}

#[test]
fn repeated_runs_are_identical() {
    let dir = TempDir::new().expect("tempdir");
    let config = reference_config(write_voice_csv(dir.path(), 11));

    let first = run_analysis(&config).expect("first run");
    let second = run_analysis(&config).expect("second run");

    assert_eq!(
        first.final_fit().formula.to_string(),
        second.final_fit().formula.to_string()
    );
    assert_eq!(first.final_fit().coefficients, second.final_fit().coefficients);
    assert_eq!(first.confusion, second.confusion);
    assert_eq!(first.train, second.train);
}

#[test]
fn scaling_on_train_keeps_the_partition() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = reference_config(write_voice_csv(dir.path(), 3));
    let full_table = run_analysis(&config).expect("full-table scaling");

    config.scale_on_train = true;
    let train_only = run_analysis(&config).expect("train-only scaling");

    assert_eq!(full_table.train, train_only.train);
    assert_eq!(full_table.test, train_only.test);
    assert_ne!(full_table.scaling[0].mean, train_only.scaling[0].mean);
    assert!(train_only
        .render()
        .contains("fit on the training partition"));
}

#[test]
fn greedy_filter_leaves_no_pair_above_threshold() {
    let dir = TempDir::new().expect("tempdir");
    let config = RunConfig::for_dataset(write_voice_csv(dir.path(), 5));
    let (_, exploration) = run_exploration(&config).expect("exploration");

    let selection = reduce_features(&exploration.correlation, config.correlation_threshold, &[])
        .expect("selection");
    assert!(!selection.overridden);
    assert!(selection.violations.is_empty());
    assert!(selection.dropped.len() >= 2);

    let retained = exploration
        .correlation
        .restrict(&selection.retained)
        .expect("retained features are in the matrix");
    assert!(retained.pairs_above(config.correlation_threshold).is_empty());
}

#[test]
fn missing_cells_are_rejected_or_imputed() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_voice_csv(dir.path(), 13);
    let text = std::fs::read_to_string(&path).expect("read csv");
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut cells: Vec<String> = lines[5].split(',').map(str::to_string).collect();
    cells[8] = "NA".to_string();
    lines[5] = cells.join(",");
    std::fs::write(&path, lines.join("\n")).expect("write csv");

    let mut config = reference_config(path);
    let err = run_analysis(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("RPDE"));

    config.missing_policy = MissingPolicy::ImputeMean;
    let report = run_analysis(&config).expect("imputed analysis");
    assert!(report
        .notes
        .iter()
        .any(|note| note.contains("'RPDE' had 1 missing value")));
}

#[test]
fn report_is_written_to_disk() {
    let dir = TempDir::new().expect("tempdir");
    let config = reference_config(write_voice_csv(dir.path(), 17));
    let report = run_analysis(&config).expect("analysis");

    let output = dir.path().join("report.txt");
    report.persist(&output).expect("persist");
    let written = std::fs::read_to_string(&output).expect("read report");
    assert_eq!(written, report.render());
}

#[test]
fn bundled_config_names_the_reference_features() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/parkinsons.toml");
    let file = FileConfig::load(&path).expect("bundled config");

    let retain = file.retain.expect("retain list");
    assert_eq!(retain, RETAINED.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    assert_eq!(file.seed, Some(225));
    assert_eq!(file.split, Some(0.8));
    let interactions = file.interactions.expect("interaction list");
    assert!(interactions.iter().all(|name| retain.contains(name)));
}
