use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, ensure, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use nalgebra::DMatrix;

use crate::MissingPolicy;

const MISSING_TOKENS: [&str; 4] = ["", "NA", "NaN", "nan"];

/// Table exactly as read from disk. Missing feature cells are NaN and a
/// missing response is `None`.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub source: PathBuf,
    pub id_column: String,
    pub response_column: String,
    pub ids: Vec<String>,
    pub response: Vec<Option<u8>>,
    pub feature_names: Vec<String>,
    pub features: DMatrix<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingCount {
    pub column: String,
    pub missing: usize,
}

/// Complete observation table: identifiers, 0/1 response and one column per
/// continuous feature.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub ids: Vec<String>,
    pub response: Vec<u8>,
    pub feature_names: Vec<String>,
    pub features: DMatrix<f64>,
    pub imputed: Vec<MissingCount>,
}

impl Dataset {
    pub fn nrows(&self) -> usize {
        self.response.len()
    }

    /// Columns named in `names`, in that order.
    pub fn select_columns(&self, names: &[String]) -> Result<DMatrix<f64>> {
        let indices = names
            .iter()
            .map(|name| {
                self.feature_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| anyhow!("feature column '{}' not found in dataset", name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.features.select_columns(&indices))
    }
}

fn is_missing(raw: &str) -> bool {
    MISSING_TOKENS.contains(&raw.trim())
}

pub(crate) fn parse_numeric_field(
    record: &StringRecord,
    index: usize,
    dataset: &Path,
    column: &str,
    row_idx: usize,
) -> Result<f64> {
    let raw = record.get(index).ok_or_else(|| {
        anyhow!(
            "{}: column '{}' missing at row {}",
            dataset.display(),
            column,
            row_idx + 2
        )
    })?;

    if is_missing(raw) {
        return Ok(f64::NAN);
    }

    raw.trim().parse::<f64>().with_context(|| {
        format!(
            "{}: column '{}' must be numeric at row {} (found '{}')",
            dataset.display(),
            column,
            row_idx + 2,
            raw
        )
    })
}

fn parse_response_field(
    record: &StringRecord,
    index: usize,
    dataset: &Path,
    column: &str,
    row_idx: usize,
) -> Result<Option<u8>> {
    let value = parse_numeric_field(record, index, dataset, column, row_idx)?;
    if value.is_nan() {
        return Ok(None);
    }
    match value {
        v if v == 0.0 => Ok(Some(0)),
        v if v == 1.0 => Ok(Some(1)),
        other => bail!(
            "{}: response column '{}' must be 0 or 1 at row {} (found {})",
            dataset.display(),
            column,
            row_idx + 2,
            other
        ),
    }
}

/// Read a comma-delimited file with a header row.
pub fn load_dataset(path: &Path, id_column: &str, response_column: &str) -> Result<RawTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open dataset {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("{}: unable to read CSV header", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut seen = HashSet::new();
    for header in &headers {
        ensure!(
            seen.insert(header.as_str()),
            "{}: column '{}' appears more than once in the header",
            path.display(),
            header
        );
    }

    let id_idx = headers
        .iter()
        .position(|h| h == id_column)
        .ok_or_else(|| anyhow!("identifier column '{}' not found in dataset header", id_column))?;
    let response_idx = headers
        .iter()
        .position(|h| h == response_column)
        .ok_or_else(|| {
            anyhow!(
                "response column '{}' not found in dataset header",
                response_column
            )
        })?;

    let feature_indices: Vec<usize> = (0..headers.len())
        .filter(|&idx| idx != id_idx && idx != response_idx)
        .collect();
    ensure!(
        !feature_indices.is_empty(),
        "{}: no feature columns besides '{}' and '{}'",
        path.display(),
        id_column,
        response_column
    );
    let feature_names: Vec<String> = feature_indices
        .iter()
        .map(|&idx| headers[idx].clone())
        .collect();

    let mut ids = Vec::new();
    let mut response = Vec::new();
    let mut buffer = Vec::new();

    for (row_idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("{}: failed to parse CSV row {}", path.display(), row_idx + 2)
        })?;

        ids.push(record.get(id_idx).unwrap_or_default().trim().to_string());
        response.push(parse_response_field(
            &record,
            response_idx,
            path,
            response_column,
            row_idx,
        )?);
        for (&idx, name) in feature_indices.iter().zip(&feature_names) {
            buffer.push(parse_numeric_field(&record, idx, path, name, row_idx)?);
        }
    }

    if ids.is_empty() {
        bail!(
            "dataset '{}' does not contain any records after header row",
            path.display()
        );
    }

    log::info!(
        "Loaded {} rows x {} feature columns from {}",
        ids.len(),
        feature_names.len(),
        path.display()
    );

    Ok(RawTable {
        source: path.to_path_buf(),
        id_column: id_column.to_string(),
        response_column: response_column.to_string(),
        features: DMatrix::from_row_slice(ids.len(), feature_names.len(), &buffer),
        ids,
        response,
        feature_names,
    })
}

/// Missing-cell counts for every column, identifier and response included.
pub fn missingness(table: &RawTable) -> Vec<MissingCount> {
    let mut counts = Vec::with_capacity(table.feature_names.len() + 2);
    counts.push(MissingCount {
        column: table.id_column.clone(),
        missing: table.ids.iter().filter(|id| is_missing(id)).count(),
    });
    counts.push(MissingCount {
        column: table.response_column.clone(),
        missing: table.response.iter().filter(|y| y.is_none()).count(),
    });
    for (j, name) in table.feature_names.iter().enumerate() {
        counts.push(MissingCount {
            column: name.clone(),
            missing: table.features.column(j).iter().filter(|v| v.is_nan()).count(),
        });
    }
    counts
}

pub fn apply_missing_policy(table: RawTable, policy: MissingPolicy) -> Result<Dataset> {
    let response_missing = table.response.iter().filter(|y| y.is_none()).count();
    ensure!(
        response_missing == 0,
        "response column '{}' has {} missing values; rows without a label cannot be used",
        table.response_column,
        response_missing
    );

    let incomplete: Vec<MissingCount> = missingness(&table)
        .into_iter()
        .skip(2)
        .filter(|count| count.missing > 0)
        .collect();

    let mut features = table.features;
    if !incomplete.is_empty() {
        match policy {
            MissingPolicy::Reject => bail!(
                "dataset has missing values in: {}; rerun with --missing impute-mean to fill them",
                incomplete
                    .iter()
                    .map(|c| format!("{} ({})", c.column, c.missing))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            MissingPolicy::ImputeMean => {
                for mut column in features.column_iter_mut() {
                    let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
                    ensure!(
                        !observed.is_empty(),
                        "cannot impute a column with no observed values"
                    );
                    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
                    for value in column.iter_mut() {
                        if value.is_nan() {
                            *value = mean;
                        }
                    }
                }
                log::warn!(
                    "Imputed column means for {} column(s) with missing values",
                    incomplete.len()
                );
            }
        }
    }

    Ok(Dataset {
        ids: table.ids,
        response: table.response.into_iter().flatten().collect(),
        feature_names: table.feature_names,
        features,
        imputed: incomplete,
    })
}
