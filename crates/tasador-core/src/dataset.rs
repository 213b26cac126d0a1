//! Property dataset: CSV ingest, `price_m2` derivation and the precondition
//! check that runs before training.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

/// Column added by processing.
pub const DERIVED_COLUMN: &str = "price_m2";
const PRICE_COLUMN: &str = "price";
const SIZE_COLUMN: &str = "house_size";
const PREVIEW_ROWS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("missing column '{0}'")]
    MissingColumn(String),

    #[error("row {row}: column '{column}' is not numeric ('{value}')")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },

    #[error("row {row}: column '{column}' = {value} {constraint}")]
    OutOfRange {
        row: usize,
        column: String,
        value: f64,
        constraint: &'static str,
    },

    #[error("dataset has {rows} rows, at least {min} required")]
    TooFewRows { rows: usize, min: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw string table as read from CSV. Column order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let read_err = |source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_err)?;
        let headers = reader
            .headers()
            .map_err(read_err)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(read_err)?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    /// Write as CSV, creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let write_err = |source| DatasetError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = csv::Writer::from_path(path).map_err(write_err)?;
        writer.write_record(&self.headers).map_err(write_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(write_err)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, DatasetError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
    }

    /// Parse a column as `f64`. Row numbers in errors are 1-based data rows.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, DatasetError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let raw = row.get(idx).map(String::as_str).unwrap_or("");
                raw.parse::<f64>().map_err(|_| DatasetError::NotNumeric {
                    row: i + 1,
                    column: name.to_string(),
                    value: raw.to_string(),
                })
            })
            .collect()
    }

    /// Set `name` to `values`, replacing the column if it exists or appending it.
    fn set_column(&mut self, name: &str, values: Vec<String>) {
        match self.headers.iter().position(|h| h == name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    if idx < row.len() {
                        row[idx] = value;
                    } else {
                        row.resize(idx, String::new());
                        row.push(value);
                    }
                }
            }
            None => {
                let width = self.headers.len();
                self.headers.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.resize(width, String::new());
                    row.push(value);
                }
            }
        }
    }
}

/// What the ingest step saw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
}

/// Read the raw dataset and report its shape.
pub fn ingest(path: impl AsRef<Path>) -> Result<IngestSummary, DatasetError> {
    let path = path.as_ref();
    let table = Table::read(path)?;

    for row in table.rows().iter().take(PREVIEW_ROWS) {
        debug!(row = ?row, "dataset preview");
    }
    info!(path = %path.display(), rows = table.len(), columns = table.headers().len(), "ingest complete");

    Ok(IngestSummary {
        path: path.to_path_buf(),
        rows: table.len(),
        columns: table.headers().to_vec(),
    })
}

/// What the process step wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub output: PathBuf,
    pub rows: usize,
}

/// Append `price_m2 = price / house_size` and write the processed dataset.
///
/// A `house_size` of zero yields `inf`, which the training precondition
/// rejects.
pub fn process(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<ProcessSummary, DatasetError> {
    let mut table = Table::read(input)?;
    let prices = table.numeric_column(PRICE_COLUMN)?;
    let sizes = table.numeric_column(SIZE_COLUMN)?;

    let derived = prices
        .iter()
        .zip(&sizes)
        .map(|(price, size)| (price / size).to_string())
        .collect();
    table.set_column(DERIVED_COLUMN, derived);

    let output = output.as_ref();
    table.write(output)?;
    info!(output = %output.display(), rows = table.len(), "processing complete");

    Ok(ProcessSummary {
        output: output.to_path_buf(),
        rows: table.len(),
    })
}

/// Numeric design matrix that passed the training precondition check.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingFrame {
    pub features: Vec<String>,
    /// One row per sample, columns in `features` order
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
}

impl TrainingFrame {
    /// Validate `table` and extract features and target.
    ///
    /// Requires the feature, target and derived columns; every value finite;
    /// features non-negative; target strictly positive; at least `min_rows` rows.
    pub fn from_table(
        table: &Table,
        features: &[String],
        target: &str,
        min_rows: usize,
    ) -> Result<Self, DatasetError> {
        for column in features
            .iter()
            .map(String::as_str)
            .chain([target, DERIVED_COLUMN])
        {
            table.column_index(column)?;
        }

        if table.len() < min_rows {
            return Err(DatasetError::TooFewRows {
                rows: table.len(),
                min: min_rows,
            });
        }

        let check = |column: &str, values: &[f64], constraint: &'static str, ok: fn(f64) -> bool| {
            match values.iter().position(|v| !ok(*v)) {
                Some(i) => Err(DatasetError::OutOfRange {
                    row: i + 1,
                    column: column.to_string(),
                    value: values[i],
                    constraint,
                }),
                None => Ok(()),
            }
        };

        let mut columns = Vec::with_capacity(features.len());
        for name in features {
            let values = table.numeric_column(name)?;
            check(name, &values, "must be a finite non-negative number", |v| {
                v.is_finite() && v >= 0.0
            })?;
            columns.push(values);
        }

        let y = table.numeric_column(target)?;
        check(target, &y, "must be a finite positive number", |v| {
            v.is_finite() && v > 0.0
        })?;

        let derived = table.numeric_column(DERIVED_COLUMN)?;
        check(DERIVED_COLUMN, &derived, "must be finite", f64::is_finite)?;

        let x = (0..table.len())
            .map(|row| columns.iter().map(|col| col[row]).collect())
            .collect();

        Ok(Self {
            features: features.to_vec(),
            x,
            y,
        })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}
