//! K-fold cross-validated lambda tuning.
//!
//! Fold membership is drawn once per run, so every lambda is compared on the
//! same partitions. Each (lambda, fold) cell fits on the training rows with
//! prevalence computed from the raw matrix restricted to those rows, then
//! scores the held-out rows. A cell that fails is logged and recorded as
//! missing; the rest of the grid keeps going.

use super::autoscale::check_raw_shape;
use super::sink::{SinkError, TuningSink};
use crate::config::SelectorConfig;
use crate::metrics::{ScoreReport, mask_mcc};
use crate::model::LabelMapping;
use crate::optimizer::{FitError, fit};
use crate::prevalence::{PrevalenceProvider, PrevalenceSummary};
use crate::progress::{TuneProgressObserver, TuneProgressStage};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Cannot split {n_samples} samples into {k} folds; need 2 <= k <= n_samples.")]
    InvalidFolds { k: usize, n_samples: usize },
    #[error("The lambda range is empty.")]
    EmptyLambdaRange,
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    pub k: usize,
    pub seed: u64,
    /// Keep the class ratio of every fold close to the overall ratio.
    pub stratified: bool,
    /// Run the folds of one lambda on the rayon pool.
    pub parallel: bool,
    /// Skip lambdas whose record is already in the sink.
    pub resume: bool,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            k: 5,
            seed: 42,
            stratified: true,
            parallel: true,
            resume: false,
        }
    }
}

/// Cross-validated summary of one lambda.
///
/// Fold-level vectors hold `None` for folds whose fit failed or whose metric
/// is undefined. Means skip those entries and are `None` when nothing is left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaRecord {
    /// Position of this lambda in the grid passed to `tune`.
    pub index: usize,
    pub lambda: f64,
    pub feature_count: Option<f64>,
    pub feature_counts: Vec<Option<usize>>,
    /// Prevalence of the selected features, averaged over folds that selected any.
    pub prevalence_summary: Option<PrevalenceSummary>,
    pub auc: Option<f64>,
    pub aupr: Option<f64>,
    pub mcc: Option<f64>,
    /// Held-out log-loss.
    pub log_loss: Option<f64>,
    pub fold_auc: Vec<Option<f64>>,
    pub fold_aupr: Vec<Option<f64>>,
    pub fold_mcc: Vec<Option<f64>>,
    /// Fold-averaged training loss per iteration.
    pub loss_history: Vec<f64>,
    /// Fold-averaged parameter displacement per iteration.
    pub error_history: Vec<f64>,
    /// Mean MCC between the selection masks of every pair of successful folds.
    ///
    /// A pair of identical masks that keep every feature, or drop every
    /// feature, has an undefined correlation and scores 0 rather than 1. A
    /// fully collapsed lambda therefore reports 0 here even though its folds
    /// agree perfectly; read it alongside `feature_count`.
    pub pairwise_mcc: Option<f64>,
    pub failed_folds: usize,
}

/// All records of a tuning run, ordered by lambda ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningResult {
    records: Vec<LambdaRecord>,
}

impl TuningResult {
    pub fn from_records(mut records: Vec<LambdaRecord>) -> Self {
        records.sort_by(|a, b| a.lambda.total_cmp(&b.lambda).then(a.index.cmp(&b.index)));
        Self { records }
    }

    pub fn records(&self) -> &[LambdaRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn lambdas(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.lambda).collect()
    }

    /// The record for `lambda`, compared with a relative tolerance of `1e-12`.
    pub fn get(&self, lambda: f64) -> Option<&LambdaRecord> {
        self.records
            .iter()
            .find(|r| (r.lambda - lambda).abs() <= 1e-12 * lambda.abs().max(f64::MIN_POSITIVE))
    }

    /// Highest mean AUC; ties go to the larger lambda, which selects fewer features.
    pub fn best_by_auc(&self) -> Option<&LambdaRecord> {
        self.records
            .iter()
            .filter(|r| r.auc.is_some())
            .max_by(|a, b| {
                a.auc
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&b.auc.unwrap_or(f64::NEG_INFINITY))
                    .then(a.lambda.total_cmp(&b.lambda))
            })
    }
}

/// Assigns each sample a fold in `0..k`.
///
/// Samples are shuffled with `seed` (per class when `stratified`) and dealt
/// round-robin, so fold sizes differ by at most one.
pub fn fold_assignment(
    y: ArrayView1<f64>,
    k: usize,
    seed: u64,
    stratified: bool,
) -> Result<Vec<usize>, TuneError> {
    let n_samples = y.len();
    if k < 2 || k > n_samples {
        return Err(TuneError::InvalidFolds { k, n_samples });
    }
    let groups: Vec<Vec<usize>> = if stratified {
        let truth = LabelMapping::from_labels(y)?.encode_bool(y)?;
        let (positives, negatives): (Vec<usize>, Vec<usize>) =
            (0..n_samples).partition(|&i| truth[i]);
        vec![negatives, positives]
    } else {
        vec![(0..n_samples).collect()]
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![0; n_samples];
    let mut dealt = 0;
    for mut group in groups {
        group.shuffle(&mut rng);
        for sample in group {
            folds[sample] = dealt % k;
            dealt += 1;
        }
    }
    Ok(folds)
}

struct Fold {
    train_x: Array2<f64>,
    train_y: Array1<f64>,
    test_x: Array2<f64>,
    test_y: Array1<f64>,
    prevalence: Array1<f64>,
}

impl Fold {
    fn split(
        x_input: ArrayView2<f64>,
        x_raw: ArrayView2<f64>,
        y: ArrayView1<f64>,
        assignment: &[usize],
        fold: usize,
        provider: &dyn PrevalenceProvider,
    ) -> Self {
        let (test, train): (Vec<usize>, Vec<usize>) =
            (0..assignment.len()).partition(|&i| assignment[i] == fold);
        Self {
            train_x: x_input.select(Axis(0), &train),
            train_y: y.select(Axis(0), &train),
            test_x: x_input.select(Axis(0), &test),
            test_y: y.select(Axis(0), &test),
            prevalence: provider.prevalence(x_raw, &train),
        }
    }
}

struct CellOutcome {
    report: ScoreReport,
    mask: Vec<bool>,
    summary: Option<PrevalenceSummary>,
    loss_history: Vec<f64>,
    displacement_history: Vec<f64>,
}

fn run_cell(fold: &Fold, selector: &SelectorConfig) -> Result<CellOutcome, FitError> {
    let model = fit(
        fold.train_x.view(),
        fold.train_y.view(),
        fold.prevalence.view(),
        selector,
    )?;
    let report = model.score(fold.test_x.view(), fold.test_y.view())?;
    let mask = model.feature_set();
    let summary = PrevalenceSummary::of_selected(&fold.prevalence, &mask);
    let diagnostics = model.diagnostics();
    Ok(CellOutcome {
        report,
        mask,
        summary,
        loss_history: diagnostics.loss_history.clone(),
        displacement_history: diagnostics.displacement_history.clone(),
    })
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn mean_present(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Point-wise mean of trajectories of different lengths; a trajectory that
/// stopped early contributes its last value to the remaining positions.
fn average_trajectories(trajectories: &[&[f64]]) -> Vec<f64> {
    let present: Vec<&[f64]> = trajectories.iter().copied().filter(|t| !t.is_empty()).collect();
    let longest = present.iter().map(|t| t.len()).max().unwrap_or(0);
    let count = present.len() as f64;
    (0..longest)
        .map(|step| {
            present
                .iter()
                .map(|t| t[step.min(t.len() - 1)])
                .sum::<f64>()
                / count
        })
        .collect()
}

fn pairwise_mask_mcc(masks: &[&[bool]]) -> Option<f64> {
    let scores: Vec<Option<f64>> = masks
        .iter()
        .tuple_combinations()
        .map(|(a, b)| Some(mask_mcc(a, b)))
        .collect();
    mean_present(&scores)
}

fn aggregate(index: usize, lambda: f64, cells: Vec<Result<CellOutcome, FitError>>) -> LambdaRecord {
    let mut feature_counts = Vec::with_capacity(cells.len());
    let mut fold_auc = Vec::with_capacity(cells.len());
    let mut fold_aupr = Vec::with_capacity(cells.len());
    let mut fold_mcc = Vec::with_capacity(cells.len());
    let mut fold_log_loss = Vec::with_capacity(cells.len());
    let mut succeeded = Vec::with_capacity(cells.len());

    for (fold, cell) in cells.into_iter().enumerate() {
        match cell {
            Ok(outcome) => {
                feature_counts.push(Some(outcome.mask.iter().filter(|&&s| s).count()));
                fold_auc.push(finite(outcome.report.auc));
                fold_aupr.push(finite(outcome.report.aupr));
                fold_mcc.push(finite(outcome.report.mcc));
                fold_log_loss.push(finite(outcome.report.log_loss));
                succeeded.push(outcome);
            }
            Err(err) => {
                log::warn!("lambda {lambda:.3e}, fold {fold}: {err}; recording the cell as missing");
                feature_counts.push(None);
                fold_auc.push(None);
                fold_aupr.push(None);
                fold_mcc.push(None);
                fold_log_loss.push(None);
            }
        }
    }

    let counts: Vec<Option<f64>> = feature_counts.iter().map(|c| c.map(|c| c as f64)).collect();
    let summaries: Vec<PrevalenceSummary> = succeeded.iter().filter_map(|c| c.summary).collect();
    let losses: Vec<&[f64]> = succeeded.iter().map(|c| c.loss_history.as_slice()).collect();
    let errors: Vec<&[f64]> = succeeded
        .iter()
        .map(|c| c.displacement_history.as_slice())
        .collect();
    let masks: Vec<&[bool]> = succeeded.iter().map(|c| c.mask.as_slice()).collect();

    LambdaRecord {
        index,
        lambda,
        feature_count: mean_present(&counts),
        prevalence_summary: PrevalenceSummary::average(&summaries),
        auc: mean_present(&fold_auc),
        aupr: mean_present(&fold_aupr),
        mcc: mean_present(&fold_mcc),
        log_loss: mean_present(&fold_log_loss),
        loss_history: average_trajectories(&losses),
        error_history: average_trajectories(&errors),
        pairwise_mcc: pairwise_mask_mcc(&masks),
        failed_folds: feature_counts.iter().filter(|c| c.is_none()).count(),
        feature_counts,
        fold_auc,
        fold_aupr,
        fold_mcc,
    }
}

/// Cross-validates every lambda in `lambdas` and persists one record per lambda.
///
/// Returns the records of this run, together with any resumed from `sink`,
/// ordered by lambda. Invalid folds, an empty grid, inputs that fail
/// validation and sink errors abort the run; fit failures inside a cell do not.
#[allow(clippy::too_many_arguments)]
pub fn tune(
    x_input: ArrayView2<f64>,
    x_raw: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambdas: &[f64],
    selector: &SelectorConfig,
    config: &TuneConfig,
    provider: &dyn PrevalenceProvider,
    sink: &mut dyn TuningSink,
    observer: &mut dyn TuneProgressObserver,
) -> Result<TuningResult, TuneError> {
    if lambdas.is_empty() {
        return Err(TuneError::EmptyLambdaRange);
    }
    if y.len() != x_input.nrows() {
        return Err(FitError::ShapeMismatch {
            what: "label vector",
            expected: x_input.nrows(),
            found: y.len(),
        }
        .into());
    }
    check_raw_shape(x_input, x_raw)?;
    for &lambda in lambdas {
        selector.with_lmbd(lambda).validate()?;
    }
    let assignment = fold_assignment(y, config.k, config.seed, config.stratified)?;
    let folds: Vec<Fold> = (0..config.k)
        .map(|fold| Fold::split(x_input, x_raw, y, &assignment, fold, provider))
        .collect();

    let mut records = if config.resume {
        sink.completed()?
    } else {
        Vec::new()
    };
    records.retain(|r| lambdas.get(r.index).is_some_and(|&l| l.to_bits() == r.lambda.to_bits()));

    log::info!(
        "Tuning {} lambdas with {}-fold cross-validation ({} already complete)",
        lambdas.len(),
        config.k,
        records.len()
    );
    observer.on_stage_start(TuneProgressStage::CrossValidation, lambdas.len());

    for (index, &lambda) in lambdas.iter().enumerate() {
        if records.iter().any(|r| r.index == index) {
            log::debug!("lambda {lambda:.3e} already tuned, skipping");
            observer.on_lambda_finished(TuneProgressStage::CrossValidation, lambda, index + 1);
            continue;
        }
        let cell_config = selector.with_lmbd(lambda);
        let cells: Vec<Result<CellOutcome, FitError>> = if config.parallel {
            folds.par_iter().map(|fold| run_cell(fold, &cell_config)).collect()
        } else {
            folds.iter().map(|fold| run_cell(fold, &cell_config)).collect()
        };
        let record = aggregate(index, lambda, cells);
        log::debug!(
            "lambda {:.3e}: mean AUC {:?}, mean features {:?}, pairwise MCC {:?}",
            lambda,
            record.auc,
            record.feature_count,
            record.pairwise_mcc
        );
        sink.write_record(&record)?;
        records.push(record);
        observer.on_lambda_finished(TuneProgressStage::CrossValidation, lambda, index + 1);
    }
    observer.on_stage_finish(TuneProgressStage::CrossValidation);

    let result = TuningResult::from_records(records);
    if let Some(best) = result.best_by_auc() {
        log::info!(
            "Best mean AUC {:.4} at lambda {:.3e}",
            best.auc.unwrap_or(f64::NAN),
            best.lambda
        );
    }
    Ok(result)
}
