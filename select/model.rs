use crate::backend::{ComputeBackend, SerialBackend};
use crate::metrics::{self, ScoreReport};
use crate::optimizer::{FitError, sigmoid};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// A fitted model is a value: `fit` builds it once and nothing mutates it
// afterwards. Prediction and scoring read it through `&self`.

/// The two original label values and which of them the model calls positive.
///
/// The larger value maps to 1, so a positive weight means "pushes toward `positive`".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelMapping {
    pub negative: f64,
    pub positive: f64,
}

impl LabelMapping {
    /// Builds the mapping from a label vector with exactly two distinct, finite values.
    pub fn from_labels(y: ArrayView1<f64>) -> Result<Self, FitError> {
        let mut distinct: Vec<f64> = Vec::with_capacity(2);
        for &label in y.iter() {
            if !label.is_finite() {
                return Err(FitError::InvalidLabel(format!(
                    "labels must be finite, found {label}"
                )));
            }
            if !distinct.contains(&label) {
                distinct.push(label);
                if distinct.len() > 2 {
                    return Err(FitError::InvalidLabel(format!(
                        "expected exactly two distinct labels, found at least three ({:?})",
                        distinct
                    )));
                }
            }
        }
        match distinct.as_slice() {
            [a, b] => Ok(Self {
                negative: a.min(*b),
                positive: a.max(*b),
            }),
            _ => Err(FitError::InvalidLabel(format!(
                "expected exactly two distinct labels, found {}",
                distinct.len()
            ))),
        }
    }

    /// Maps original labels to 0/1 targets. Unseen labels are rejected.
    pub fn encode(&self, y: ArrayView1<f64>) -> Result<Array1<f64>, FitError> {
        let mut targets = Array1::zeros(y.len());
        for (target, &label) in targets.iter_mut().zip(y.iter()) {
            *target = if label == self.positive {
                1.0
            } else if label == self.negative {
                0.0
            } else {
                return Err(FitError::InvalidLabel(format!(
                    "label {label} was not seen at fit time (classes are {} and {})",
                    self.negative, self.positive
                )));
            };
        }
        Ok(targets)
    }

    pub fn encode_bool(&self, y: ArrayView1<f64>) -> Result<Vec<bool>, FitError> {
        Ok(self.encode(y)?.iter().map(|&t| t > 0.5).collect())
    }

    pub fn decode(&self, positive: bool) -> f64 {
        if positive { self.positive } else { self.negative }
    }
}

/// What the optimizer reports about how the fit ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Iteration at which the loop stopped (1-based).
    pub iterations: usize,
    pub final_loss: f64,
    pub final_displacement: f64,
    /// `true` when the displacement fell below `tol`, `false` when `max_iter` was exhausted.
    pub converged: bool,
    #[serde(default)]
    pub loss_history: Vec<f64>,
    #[serde(default)]
    pub displacement_history: Vec<f64>,
}

/// Direction of association of a selected feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tendency {
    /// Positive weight: the feature raises the probability of the class mapped to 1.
    Positive,
    Negative,
}

impl fmt::Display for Tendency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tendency::Positive => "positive",
            Tendency::Negative => "negative",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub feature: String,
    pub weight: f64,
    pub tendency: Tendency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    bias: f64,
    lmbd: f64,
    classes: LabelMapping,
    weights: Array1<f64>,
    diagnostics: FitDiagnostics,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model file is unusable: {0}")]
    Invalid(#[from] FitError),
}

impl FittedModel {
    pub(crate) fn new(
        weights: Array1<f64>,
        bias: f64,
        classes: LabelMapping,
        lmbd: f64,
        diagnostics: FitDiagnostics,
    ) -> Self {
        Self {
            weights,
            bias,
            classes,
            lmbd,
            diagnostics,
        }
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn classes(&self) -> &LabelMapping {
        &self.classes
    }

    pub fn lmbd(&self) -> f64 {
        self.lmbd
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        &self.diagnostics
    }

    pub fn n_features(&self) -> usize {
        self.weights.len()
    }

    /// Inclusion mask: `true` where the weight survived the proximal step.
    pub fn feature_set(&self) -> Vec<bool> {
        self.weights.iter().map(|&w| w != 0.0).collect()
    }

    pub fn selected_count(&self) -> usize {
        self.weights.iter().filter(|&&w| w != 0.0).count()
    }

    /// Every feature index ordered by descending `|w|`, ties by ascending index.
    /// An all-zero model therefore ranks features in index order.
    pub fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.weights.len()).collect();
        order.sort_by(|&a, &b| {
            self.weights[b]
                .abs()
                .total_cmp(&self.weights[a].abs())
                .then(a.cmp(&b))
        });
        order
    }

    /// Indices of nonzero weights in ranking order.
    pub fn selected_indices(&self) -> Vec<usize> {
        self.ranking()
            .into_iter()
            .filter(|&j| self.weights[j] != 0.0)
            .collect()
    }

    fn check_columns(&self, x: ArrayView2<f64>) -> Result<(), FitError> {
        if x.ncols() != self.weights.len() {
            return Err(FitError::ShapeMismatch {
                what: "feature count at prediction time",
                expected: self.weights.len(),
                found: x.ncols(),
            });
        }
        Ok(())
    }

    /// The linear predictor `X·w + b`.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, FitError> {
        self.check_columns(x)?;
        Ok(SerialBackend.linear_predictor(x, self.weights.view(), self.bias))
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, FitError> {
        Ok(self.decision_function(x)?.mapv(sigmoid))
    }

    /// Hard predictions at probability 0.5, expressed in the original label values.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, FitError> {
        Ok(self
            .predict_proba(x)?
            .mapv(|p| self.classes.decode(p >= 0.5)))
    }

    /// Scores the model on labelled data. Labels must be the two seen at fit time.
    pub fn score(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<ScoreReport, FitError> {
        if y.len() != x.nrows() {
            return Err(FitError::ShapeMismatch {
                what: "label vector",
                expected: x.nrows(),
                found: y.len(),
            });
        }
        let truth = self.classes.encode_bool(y)?;
        let probabilities = self.predict_proba(x)?;
        Ok(metrics::evaluate(probabilities.view(), &truth))
    }

    /// The selection list: nonzero features in ranking order with their weight and tendency.
    pub fn selection_list(&self, feature_names: &[String]) -> Result<Vec<SelectionEntry>, FitError> {
        if feature_names.len() != self.weights.len() {
            return Err(FitError::ShapeMismatch {
                what: "feature names",
                expected: self.weights.len(),
                found: feature_names.len(),
            });
        }
        Ok(self
            .selected_indices()
            .into_iter()
            .map(|j| {
                let weight = self.weights[j];
                SelectionEntry {
                    feature: feature_names[j].clone(),
                    weight,
                    tendency: if weight > 0.0 {
                        Tendency::Positive
                    } else {
                        Tendency::Negative
                    },
                }
            })
            .collect())
    }

    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file. A file without weights was never fitted.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        if model.weights.is_empty() {
            return Err(FitError::NotFitted.into());
        }
        Ok(model)
    }
}
