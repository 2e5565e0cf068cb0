//! Classification metrics consumed by `FittedModel::score` and the tuner.
//!
//! All functions take predicted probabilities and boolean truth (`true` for
//! the class mapped to 1). Scores within `TIE_EPS` of each other are treated as
//! one threshold, so tied predictions move the ROC and PR curves diagonally.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

const TIE_EPS: f64 = 1e-12;
const LOG_LOSS_CLAMP: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionCounts {
    pub fn from_predictions(predicted: &[bool], truth: &[bool]) -> Self {
        assert_eq!(
            predicted.len(),
            truth.len(),
            "Predictions and outcomes must have the same length."
        );
        let mut counts = Self::default();
        for (&p, &t) in predicted.iter().zip(truth) {
            match (p, t) {
                (true, true) => counts.true_positive += 1,
                (true, false) => counts.false_positive += 1,
                (false, false) => counts.true_negative += 1,
                (false, true) => counts.false_negative += 1,
            }
        }
        counts
    }

    /// Matthews correlation coefficient. Zero when any margin of the table is empty.
    pub fn mcc(&self) -> f64 {
        let tp = self.true_positive as f64;
        let fp = self.false_positive as f64;
        let tn = self.true_negative as f64;
        let fn_count = self.false_negative as f64;
        let denominator = ((tp + fp) * (tp + fn_count) * (tn + fp) * (tn + fn_count)).sqrt();
        if denominator == 0.0 {
            0.0
        } else {
            (tp * tn - fp * fn_count) / denominator
        }
    }
}

/// Precision and recall at every distinct score, thresholds descending.
///
/// A sample is called positive at threshold `t` when its score is `>= t`, so
/// recall is non-decreasing along the arrays. All three vectors share one length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRecallCurve {
    pub thresholds: Vec<f64>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
}

/// Everything the evaluator reports for one set of predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub auc: f64,
    pub aupr: f64,
    /// MCC of the predictions thresholded at 0.5.
    pub mcc: f64,
    pub log_loss: f64,
    pub curve: PrecisionRecallCurve,
}

/// Sorted (score, truth) pairs grouped into tie blocks, highest score first.
fn tie_groups(scores: ArrayView1<f64>, truth: &[bool]) -> Vec<(f64, usize, usize)> {
    assert_eq!(
        scores.len(),
        truth.len(),
        "Predictions and outcomes must have the same length."
    );
    let mut pairs: Vec<(f64, bool)> = scores.iter().copied().zip(truth.iter().copied()).collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut groups = Vec::new();
    let mut i = 0;
    while i < pairs.len() {
        let score = pairs[i].0;
        let mut positives = 0;
        let mut negatives = 0;
        while i < pairs.len() && (pairs[i].0 - score).abs() <= TIE_EPS {
            if pairs[i].1 {
                positives += 1;
            } else {
                negatives += 1;
            }
            i += 1;
        }
        groups.push((score, positives, negatives));
    }
    groups
}

/// Area under the ROC curve by trapezoids over tie groups. `NaN` when only one class is present.
pub fn roc_auc(scores: ArrayView1<f64>, truth: &[bool]) -> f64 {
    let total_positives = truth.iter().filter(|&&t| t).count() as f64;
    let total_negatives = truth.len() as f64 - total_positives;
    if total_positives == 0.0 || total_negatives == 0.0 {
        return f64::NAN;
    }

    let mut auc = 0.0;
    let (mut tp, mut fp) = (0.0, 0.0);
    let (mut last_tpr, mut last_fpr) = (0.0, 0.0);
    for (_, positives, negatives) in tie_groups(scores, truth) {
        tp += positives as f64;
        fp += negatives as f64;
        let tpr = tp / total_positives;
        let fpr = fp / total_negatives;
        auc += (fpr - last_fpr) * (tpr + last_tpr) / 2.0;
        last_tpr = tpr;
        last_fpr = fpr;
    }
    auc
}

pub fn precision_recall_curve(scores: ArrayView1<f64>, truth: &[bool]) -> PrecisionRecallCurve {
    let total_positives = truth.iter().filter(|&&t| t).count() as f64;
    let mut curve = PrecisionRecallCurve::default();
    let (mut tp, mut fp) = (0.0, 0.0);
    for (score, positives, negatives) in tie_groups(scores, truth) {
        tp += positives as f64;
        fp += negatives as f64;
        curve.thresholds.push(score);
        curve.precision.push(tp / (tp + fp));
        curve.recall.push(if total_positives > 0.0 {
            tp / total_positives
        } else {
            0.0
        });
    }
    curve
}

/// Step-wise area under the precision/recall curve (average precision).
/// `NaN` when the curve has no positives to recall.
pub fn average_precision(curve: &PrecisionRecallCurve) -> f64 {
    if curve.recall.last().is_none_or(|&r| r == 0.0) {
        return f64::NAN;
    }
    let mut last_recall = 0.0;
    let mut area = 0.0;
    for (&precision, &recall) in curve.precision.iter().zip(&curve.recall) {
        area += (recall - last_recall) * precision;
        last_recall = recall;
    }
    area
}

pub fn log_loss(probabilities: ArrayView1<f64>, truth: &[bool]) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let total: f64 = probabilities
        .iter()
        .zip(truth)
        .map(|(&p_raw, &t)| {
            let p = p_raw.clamp(LOG_LOSS_CLAMP, 1.0 - LOG_LOSS_CLAMP);
            if t { -p.ln() } else { -(1.0 - p).ln() }
        })
        .sum();
    total / truth.len() as f64
}

/// MCC between two selection masks: how consistently two fits chose the same features.
///
/// Masks that are constant (all kept or all dropped) have no variance, so any
/// pair involving one scores 0, including two identical constant masks.
pub fn mask_mcc(first: &[bool], second: &[bool]) -> f64 {
    ConfusionCounts::from_predictions(first, second).mcc()
}

/// Scores probabilities against truth: AUC, AUPR, MCC at 0.5, log-loss and the PR curve.
pub fn evaluate(probabilities: ArrayView1<f64>, truth: &[bool]) -> ScoreReport {
    let predicted: Vec<bool> = probabilities.iter().map(|&p| p >= 0.5).collect();
    let curve = precision_recall_curve(probabilities, truth);
    ScoreReport {
        auc: roc_auc(probabilities, truth),
        aupr: average_precision(&curve),
        mcc: ConfusionCounts::from_predictions(&predicted, truth).mcc(),
        log_loss: log_loss(probabilities, truth),
        curve,
    }
}
