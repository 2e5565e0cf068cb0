//! Lambda auto-scaling.
//!
//! Sweeps lambda over a fixed geometric grid, fitting once per grid point and
//! counting selected features. The onset boundary is the largest grid lambda
//! before collapse that still keeps every feature. The collapse boundary starts
//! as the first grid lambda that keeps none and is then narrowed by bisection
//! in log10 space against the last grid lambda that still kept something, so it
//! approximates the smallest lambda that empties the model. The returned grid
//! spans both boundaries, inclusive, in log10 space.

use crate::config::SelectorConfig;
use crate::optimizer::{FitError, fit};
use crate::prevalence::PrevalenceProvider;
use crate::progress::{TuneProgressObserver, TuneProgressStage};
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutoScaleError {
    #[error(
        "No lambda in [{lower:.1e}, {upper:.1e}] bounds the selection range; widen the sweep."
    )]
    RangeNotFound { lower: f64, upper: f64 },
    #[error("At least two output points are required, got {0}.")]
    InvalidStep(usize),
    #[error("Invalid sweep grid: {0}")]
    InvalidGrid(String),
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// The outer sweep: `points_per_decade` points per power of ten from
/// `10^log10_min` to `10^log10_max`, both included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub log10_min: i32,
    pub log10_max: i32,
    pub points_per_decade: usize,
    /// Bisection fits spent narrowing the collapse boundary; 0 keeps the grid point.
    pub refine_steps: usize,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            log10_min: -10,
            log10_max: 0,
            points_per_decade: 1,
            refine_steps: 8,
        }
    }
}

impl AutoScaleConfig {
    pub fn grid(&self) -> Result<Vec<f64>, AutoScaleError> {
        if self.log10_min >= self.log10_max {
            return Err(AutoScaleError::InvalidGrid(format!(
                "log10_min ({}) must be below log10_max ({})",
                self.log10_min, self.log10_max
            )));
        }
        if self.points_per_decade == 0 {
            return Err(AutoScaleError::InvalidGrid(
                "points_per_decade must be at least 1".to_string(),
            ));
        }
        let decades = (self.log10_max - self.log10_min) as usize;
        let per = self.points_per_decade as f64;
        Ok((0..=decades * self.points_per_decade)
            .map(|i| 10f64.powf(self.log10_min as f64 + i as f64 / per))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScaleResult {
    pub onset: f64,
    pub collapse: f64,
    /// `(lambda, selected_count)` for every grid point that was fitted.
    pub sweep: Vec<(f64, usize)>,
    /// `(lambda, selected_count)` for every bisection fit, in evaluation order.
    #[serde(default)]
    pub refinement: Vec<(f64, usize)>,
    pub log_lambdas: Vec<f64>,
}

impl AutoScaleResult {
    pub fn lambdas(&self) -> Vec<f64> {
        self.log_lambdas.iter().map(|&l| 10f64.powf(l)).collect()
    }
}

/// The raw matrix must describe the same samples and features as the input matrix.
pub(crate) fn check_raw_shape(
    x_input: ArrayView2<f64>,
    x_raw: ArrayView2<f64>,
) -> Result<(), FitError> {
    if x_raw.nrows() != x_input.nrows() {
        return Err(FitError::ShapeMismatch {
            what: "raw matrix rows",
            expected: x_input.nrows(),
            found: x_raw.nrows(),
        });
    }
    if x_raw.ncols() != x_input.ncols() {
        return Err(FitError::ShapeMismatch {
            what: "raw matrix columns",
            expected: x_input.ncols(),
            found: x_raw.ncols(),
        });
    }
    Ok(())
}

/// `step` values evenly spaced from `start` to `end`, both included.
pub fn log_space(start: f64, end: f64, step: usize) -> Vec<f64> {
    let last = (step - 1) as f64;
    (0..step)
        .map(|i| {
            if i + 1 == step {
                end
            } else {
                start + (end - start) * i as f64 / last
            }
        })
        .collect()
}

/// Finds the onset and collapse boundaries and returns `step` log10-lambdas between them.
///
/// Prevalence comes from `x_raw` over all samples. The sweep stops at the
/// first grid point whose fit selects nothing. A collapse at the very first
/// grid point leaves no lower bound and is reported as `RangeNotFound`, as is
/// a sweep that never collapses.
#[allow(clippy::too_many_arguments)]
pub fn auto_scale(
    x_input: ArrayView2<f64>,
    x_raw: ArrayView2<f64>,
    y: ArrayView1<f64>,
    step: usize,
    selector: &SelectorConfig,
    scale: &AutoScaleConfig,
    provider: &dyn PrevalenceProvider,
    observer: &mut dyn TuneProgressObserver,
) -> Result<AutoScaleResult, AutoScaleError> {
    if step < 2 {
        return Err(AutoScaleError::InvalidStep(step));
    }
    check_raw_shape(x_input, x_raw)?;
    let grid = scale.grid()?;
    let lower = grid[0];
    let upper = grid[grid.len() - 1];
    let n_features = x_input.ncols();
    let all_rows: Vec<usize> = (0..x_raw.nrows()).collect();
    let prevalence = provider.prevalence(x_raw, &all_rows);

    log::info!(
        "Sweeping {} lambdas from {:.1e} to {:.1e} over {} features",
        grid.len(),
        lower,
        upper,
        n_features
    );
    observer.on_stage_start(TuneProgressStage::AutoScale, grid.len());

    let mut sweep = Vec::with_capacity(grid.len());
    let mut collapse_index = None;
    for (index, &lambda) in grid.iter().enumerate() {
        let model = fit(x_input, y, prevalence.view(), &selector.with_lmbd(lambda))?;
        let count = model.selected_count();
        log::debug!("lambda {lambda:.3e}: {count} of {n_features} features selected");
        sweep.push((lambda, count));
        observer.on_lambda_finished(TuneProgressStage::AutoScale, lambda, index + 1);
        if count == 0 {
            collapse_index = Some(index);
            break;
        }
    }
    observer.on_stage_finish(TuneProgressStage::AutoScale);

    let collapse_index = match collapse_index {
        Some(index) if index > 0 => index,
        _ => return Err(AutoScaleError::RangeNotFound { lower, upper }),
    };
    let onset_index = sweep[..collapse_index]
        .iter()
        .rposition(|&(_, count)| count == n_features)
        .unwrap_or(0);
    let onset = sweep[onset_index].0;
    let (collapse, refinement) = refine_collapse(
        x_input,
        y,
        prevalence.view(),
        selector,
        sweep[collapse_index - 1].0,
        sweep[collapse_index].0,
        scale.refine_steps,
    )?;

    log::info!("Selection range: onset {onset:.3e}, collapse {collapse:.3e}");

    Ok(AutoScaleResult {
        onset,
        collapse,
        sweep,
        refinement,
        log_lambdas: log_space(onset.log10(), collapse.log10(), step),
    })
}

/// Bisects `(kept, emptied]` in log10 space. `kept` must select at least one
/// feature and `emptied` none; the returned lambda always selects none.
fn refine_collapse(
    x_input: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prevalence: ArrayView1<f64>,
    selector: &SelectorConfig,
    kept: f64,
    emptied: f64,
    steps: usize,
) -> Result<(f64, Vec<(f64, usize)>), AutoScaleError> {
    let mut low = kept.log10();
    let mut high = emptied.log10();
    let mut collapse = emptied;
    let mut fitted = Vec::with_capacity(steps);
    for _ in 0..steps {
        let middle = 0.5 * (low + high);
        let lambda = 10f64.powf(middle);
        let count = fit(x_input, y, prevalence, &selector.with_lmbd(lambda))?.selected_count();
        log::debug!("bisection lambda {lambda:.3e}: {count} features selected");
        fitted.push((lambda, count));
        if count == 0 {
            high = middle;
            collapse = lambda;
        } else {
            low = middle;
        }
    }
    Ok((collapse, fitted))
}
