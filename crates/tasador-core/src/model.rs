//! Linear price model: ordinary least squares fit, prediction and R².

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ModelError {
    #[error("no training samples")]
    Empty,

    #[error("{rows} samples but {targets} targets")]
    LengthMismatch { rows: usize, targets: usize },

    #[error("expected {expected} features, got {got}")]
    FeatureCount { expected: usize, got: usize },

    #[error("design matrix is singular; features are collinear or constant")]
    Singular,

    #[error("invalid model artifact: {0}")]
    Artifact(String),

    #[error("prediction is not a finite number: {0}")]
    NonFinitePrediction(f64),
}

/// Fitted linear regression with intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    /// Fit by solving the normal equations `(XᵀX) β = Xᵀy`.
    pub fn fit(features: &[String], x: &[Vec<f64>], y: &[f64]) -> Result<Self, ModelError> {
        if x.is_empty() {
            return Err(ModelError::Empty);
        }
        if x.len() != y.len() {
            return Err(ModelError::LengthMismatch {
                rows: x.len(),
                targets: y.len(),
            });
        }
        let k = features.len();
        if let Some(row) = x.iter().find(|row| row.len() != k) {
            return Err(ModelError::FeatureCount {
                expected: k,
                got: row.len(),
            });
        }

        // Augmented design: leading 1 for the intercept.
        let p = k + 1;
        let mut xtx = vec![vec![0.0; p]; p];
        let mut xty = vec![0.0; p];
        for (row, target) in x.iter().zip(y) {
            let design: Vec<f64> = std::iter::once(1.0).chain(row.iter().copied()).collect();
            for i in 0..p {
                xty[i] += design[i] * target;
                for j in 0..p {
                    xtx[i][j] += design[i] * design[j];
                }
            }
        }

        let beta = solve(xtx, xty)?;
        Ok(Self {
            features: features.to_vec(),
            intercept: beta[0],
            coefficients: beta[1..].to_vec(),
        })
    }

    pub fn predict(&self, row: &[f64]) -> Result<f64, ModelError> {
        if row.len() != self.coefficients.len() {
            return Err(ModelError::FeatureCount {
                expected: self.coefficients.len(),
                got: row.len(),
            });
        }
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(c, v)| c * v)
                .sum::<f64>())
    }

    pub fn predict_many(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        rows.iter().map(|row| self.predict(row)).collect()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec_pretty(self).map_err(|e| ModelError::Artifact(e.to_string()))
    }

    /// Decode an artifact and check it is internally consistent.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let model: Self =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Artifact(e.to_string()))?;
        if model.features.len() != model.coefficients.len() {
            return Err(ModelError::Artifact(format!(
                "{} features but {} coefficients",
                model.features.len(),
                model.coefficients.len()
            )));
        }
        if !model.intercept.is_finite() || model.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::Artifact("non-finite parameters".to_string()));
        }
        Ok(model)
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    let n = b.len();
    let scale = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0_f64, f64::max)
        .max(1.0);
    let tolerance = scale * 1e-12;

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= tolerance {
            return Err(ModelError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

/// Coefficient of determination. A constant target scores 1.0 when predicted
/// exactly and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}
