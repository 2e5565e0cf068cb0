//! # Weighted Proximal Optimizer
//!
//! Fits a sparse logistic model by full-batch proximal RMSprop: every
//! parameter takes a gradient step at its own RMS-scaled rate, and each
//! weight is then soft-thresholded by that same rate times `lmbd * m_j`,
//! where `m_j` comes from the feature's prevalence through
//! [`PenaltyPolicy`](crate::penalty::PenaltyPolicy). The bias is never
//! thresholded.
//!
//! A fixed point of the update is a weighted-lasso solution: feature `j` is
//! zero exactly when `|g_j| <= lmbd * m_j`.
//!
//! Each iteration:
//!
//! 1. `r = sigmoid(Xw + b) - y`, `g_w = Xᵀr / n`, `g_b = mean(r)`
//! 2. `v = alpha * v + (1 - alpha) * g²` per parameter
//! 3. `rate = lr / (sqrt(v) + epsilon)`, `θ -= rate * g`
//! 4. `w_j = sign(w_j) * max(|w_j| - rate_j * lmbd * m_j, 0)`
//! 5. stop when the L2 norm of the full displacement drops below `tol`
//!
//! `fit` is a pure function of its inputs: it owns the model state and the
//! accumulators for the duration of the call and returns an immutable
//! [`FittedModel`].

use crate::config::{Initialization, SelectorConfig};
use crate::model::{FitDiagnostics, FittedModel, LabelMapping};
use crate::penalty::penalty_weights;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Invalid labels: {0}")]
    InvalidLabel(String),
    #[error("The model has not been fitted; no weights are available for prediction.")]
    NotFitted,
    #[error("Optimization diverged at iteration {iteration}: non-finite {quantity}.")]
    NumericDivergence {
        iteration: usize,
        quantity: &'static str,
    },
    #[error("Invalid selector configuration: {0}")]
    InvalidConfig(String),
    #[error("Prevalence of feature {index} is {value}, which lies outside [0, 1].")]
    InvalidPrevalence { index: usize, value: f64 },
    #[error("Design matrix entry ({row}, {column}) is not finite.")]
    NonFiniteInput { row: usize, column: usize },
}

/// Fits the prevalence-weighted sparse logistic model.
///
/// # Arguments
/// * `x`: design matrix, shape `[n_samples, n_features]`, already normalised.
/// * `y`: one label per row of `x`, exactly two distinct values.
/// * `prevalence`: one value in `[0, 1]` per column of `x`.
/// * `config`: validated here before anything is allocated.
pub fn fit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prevalence: ArrayView1<f64>,
    config: &SelectorConfig,
) -> Result<FittedModel, FitError> {
    config.validate()?;
    let (n_samples, n_features) = x.dim();
    if n_samples == 0 {
        return Err(FitError::ShapeMismatch {
            what: "design matrix rows",
            expected: 1,
            found: 0,
        });
    }
    if n_features == 0 {
        return Err(FitError::ShapeMismatch {
            what: "design matrix columns",
            expected: 1,
            found: 0,
        });
    }
    if y.len() != n_samples {
        return Err(FitError::ShapeMismatch {
            what: "label vector",
            expected: n_samples,
            found: y.len(),
        });
    }
    if prevalence.len() != n_features {
        return Err(FitError::ShapeMismatch {
            what: "prevalence vector",
            expected: n_features,
            found: prevalence.len(),
        });
    }
    if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(FitError::NonFiniteInput { row, column });
    }

    let classes = LabelMapping::from_labels(y)?;
    let targets = classes.encode(y)?;
    let multipliers = penalty_weights(prevalence, &config.penalty)?;
    let penalties = multipliers.mapv(|m| m * config.lmbd);
    let backend = config.device.backend();

    log::debug!(
        "Fitting {} samples x {} features on '{}' backend (lmbd = {:.3e}, max_iter = {})",
        n_samples,
        n_features,
        backend.name(),
        config.lmbd,
        config.max_iter
    );

    let mut w = initial_weights(n_features, &config.init);
    let mut b = 0.0_f64;
    let mut avg_w = Array1::<f64>::zeros(n_features);
    let mut avg_b = 0.0_f64;

    let alpha = config.alpha;
    let lr = config.lr;
    let eps = config.epsilon;

    let mut eta = backend.linear_predictor(x, w.view(), b);
    let mut loss = penalized_loss(eta.view(), targets.view(), w.view(), multipliers.view(), config.lmbd);
    let mut displacement = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;
    let history_capacity = if config.record_history { config.max_iter } else { 0 };
    let mut loss_history = Vec::with_capacity(history_capacity);
    let mut displacement_history = Vec::with_capacity(history_capacity);

    for iter in 1..=config.max_iter {
        iterations = iter;

        let residual = Zip::from(&eta)
            .and(&targets)
            .map_collect(|&z, &t| sigmoid(z) - t);
        let grad_w = backend.scaled_transpose_product(x, residual.view());
        let grad_b = residual.sum() / n_samples as f64;
        if !grad_b.is_finite() || grad_w.iter().any(|g| !g.is_finite()) {
            return Err(diverged(config.echo, iter, "gradient", loss, displacement));
        }

        let mut squared_step = 0.0;
        Zip::from(&mut w)
            .and(&mut avg_w)
            .and(&grad_w)
            .and(&penalties)
            .for_each(|wj, avg, &g, &penalty| {
                *avg = alpha * *avg + (1.0 - alpha) * g * g;
                let rate = lr / (avg.sqrt() + eps);
                let shrunk = soft_threshold(*wj - rate * g, rate * penalty);
                squared_step += (shrunk - *wj).powi(2);
                *wj = shrunk;
            });

        avg_b = alpha * avg_b + (1.0 - alpha) * grad_b * grad_b;
        let step_b = lr * grad_b / (avg_b.sqrt() + eps);
        b -= step_b;
        squared_step += step_b * step_b;
        displacement = squared_step.sqrt();

        eta = backend.linear_predictor(x, w.view(), b);
        loss = penalized_loss(eta.view(), targets.view(), w.view(), multipliers.view(), config.lmbd);
        if !loss.is_finite() || !displacement.is_finite() {
            let quantity = if loss.is_finite() { "displacement" } else { "loss" };
            return Err(diverged(config.echo, iter, quantity, loss, displacement));
        }
        if config.record_history {
            loss_history.push(loss);
            displacement_history.push(displacement);
        }

        if displacement < config.tol {
            converged = true;
            break;
        }
    }

    let diagnostics = FitDiagnostics {
        iterations,
        final_loss: loss,
        final_displacement: displacement,
        converged,
        loss_history,
        displacement_history,
    };
    let model = FittedModel::new(w, b, classes, config.lmbd, diagnostics);

    if config.echo {
        log::info!(
            "Fit {} after {} iterations: loss = {:.6e}, displacement = {:.6e}, {} of {} features selected.",
            if converged { "converged" } else { "hit max_iter" },
            iterations,
            loss,
            displacement,
            model.selected_count(),
            n_features
        );
    } else {
        log::debug!(
            "Fit stopped at iteration {} (converged: {}), loss = {:.6e}",
            iterations,
            converged,
            loss
        );
    }

    Ok(model)
}

fn diverged(
    echo: bool,
    iteration: usize,
    quantity: &'static str,
    loss: f64,
    displacement: f64,
) -> FitError {
    if echo {
        log::info!(
            "Fit diverged after {} iterations (non-finite {}): loss = {:.6e}, displacement = {:.6e}.",
            iteration,
            quantity,
            loss,
            displacement
        );
    } else {
        log::debug!("Fit diverged at iteration {} on a non-finite {}", iteration, quantity);
    }
    FitError::NumericDivergence {
        iteration,
        quantity,
    }
}

fn initial_weights(n_features: usize, init: &Initialization) -> Array1<f64> {
    match *init {
        Initialization::Zeros => Array1::zeros(n_features),
        Initialization::Noise { scale, seed } => {
            let mut rng = StdRng::seed_from_u64(seed);
            Array1::from_shape_fn(n_features, |_| {
                let draw: f64 = StandardNormal.sample(&mut rng);
                draw * scale
            })
        }
    }
}

/// Logistic function evaluated without overflow for large `|z|`.
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// `sign(v) * max(|v| - threshold, 0)`.
pub fn soft_threshold(value: f64, threshold: f64) -> f64 {
    let magnitude = value.abs() - threshold;
    if magnitude > 0.0 {
        magnitude.copysign(value)
    } else {
        0.0
    }
}

/// Mean binary cross-entropy of `sigmoid(eta)` against 0/1 targets, in the
/// `max(z, 0) - t z + ln(1 + e^{-|z|})` form.
pub fn cross_entropy(eta: ArrayView1<f64>, targets: ArrayView1<f64>) -> f64 {
    let n = eta.len().max(1) as f64;
    Zip::from(&eta)
        .and(&targets)
        .fold(0.0, |acc, &z, &t| acc + z.max(0.0) - t * z + (-z.abs()).exp().ln_1p())
        / n
}

// Reporting only: the penalty never enters the gradient.
fn penalized_loss(
    eta: ArrayView1<f64>,
    targets: ArrayView1<f64>,
    w: ArrayView1<f64>,
    multipliers: ArrayView1<f64>,
    lmbd: f64,
) -> f64 {
    let penalty: f64 = Zip::from(&w)
        .and(&multipliers)
        .fold(0.0, |acc, &wj, &m| acc + m * wj.abs());
    cross_entropy(eta, targets) + lmbd * penalty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;
    use crate::penalty::PenaltyPolicy;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use std::cell::RefCell;
    use std::sync::Once;

    thread_local! {
        static ECHOED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// Keeps info-level records per thread so concurrent tests stay separate.
    struct EchoLog;

    impl log::Log for EchoLog {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Info
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                ECHOED.with(|lines| lines.borrow_mut().push(record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static ECHO_LOG: EchoLog = EchoLog;
    static INSTALL_ECHO_LOG: Once = Once::new();

    fn echoed_during(run: impl FnOnce()) -> Vec<String> {
        INSTALL_ECHO_LOG.call_once(|| {
            if log::set_logger(&ECHO_LOG).is_ok() {
                log::set_max_level(log::LevelFilter::Info);
            }
        });
        ECHOED.with(|lines| lines.borrow_mut().clear());
        run();
        ECHOED.with(|lines| lines.borrow_mut().drain(..).collect())
    }

    /// Column 0 separates the classes, column 1 is weak noise.
    fn separable_problem() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [1.0, 0.3],
            [1.0, -0.2],
            [1.0, 0.1],
            [1.0, -0.4],
            [-1.0, 0.2],
            [-1.0, -0.1],
            [-1.0, 0.4],
            [-1.0, -0.3]
        ];
        let y = array![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        (x, y)
    }

    fn quick_config() -> SelectorConfig {
        SelectorConfig::default().with_max_iter(2_000)
    }

    #[test]
    fn soft_threshold_shrinks_toward_zero() {
        assert_abs_diff_eq!(soft_threshold(0.5, 0.2), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(soft_threshold(-0.5, 0.2), -0.3, epsilon = 1e-12);
        assert_eq!(soft_threshold(0.1, 0.2), 0.0);
        assert_eq!(soft_threshold(-0.2, 0.2), 0.0);
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(800.0), 1.0);
        assert_eq!(sigmoid(-800.0), 0.0);
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
        assert!(cross_entropy(array![800.0].view(), array![0.0].view()).is_finite());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let short_y = y.slice(ndarray::s![..3]).to_owned();
        assert!(matches!(
            fit(x.view(), short_y.view(), prevalence.view(), &quick_config()),
            Err(FitError::ShapeMismatch { what: "label vector", expected: 8, found: 3 })
        ));
        let short_prev = Array1::<f64>::ones(1);
        assert!(matches!(
            fit(x.view(), y.view(), short_prev.view(), &quick_config()),
            Err(FitError::ShapeMismatch { what: "prevalence vector", .. })
        ));
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            fit(empty.view(), Array1::<f64>::zeros(0).view(), prevalence.view(), &quick_config()),
            Err(FitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_label_vectors_without_exactly_two_classes() {
        let (x, _) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let one_class = Array1::<f64>::ones(8);
        assert!(matches!(
            fit(x.view(), one_class.view(), prevalence.view(), &quick_config()),
            Err(FitError::InvalidLabel(_))
        ));
        let three = array![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0];
        assert!(matches!(
            fit(x.view(), three.view(), prevalence.view(), &quick_config()),
            Err(FitError::InvalidLabel(_))
        ));
    }

    #[test]
    fn unpenalized_fit_finds_the_separating_direction() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let model = fit(x.view(), y.view(), prevalence.view(), &quick_config().with_lmbd(0.0)).unwrap();
        assert!(model.weights()[0] > 0.5);
        assert!(model.weights()[0].abs() > model.weights()[1].abs());
        assert_eq!(model.ranking()[0], 0);
        let predicted = model.predict(x.view()).unwrap();
        assert_eq!(predicted, y);
    }

    #[test]
    fn threshold_above_every_gradient_zeroes_every_weight() {
        // With mean |x_j| <= 1 no gradient can exceed 1 in magnitude.
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let config = quick_config()
            .with_lmbd(1.0)
            .with_penalty(PenaltyPolicy::Uniform);
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        assert_eq!(model.selected_count(), 0);
        assert_eq!(model.ranking(), vec![0, 1]);
        assert!(model.diagnostics().converged);
        let proba = model.predict_proba(x.view()).unwrap();
        for p in proba.iter() {
            assert_eq!(*p, 0.5);
        }
    }

    #[test]
    fn threshold_scales_with_the_adaptive_rate() {
        // A threshold below the starting gradient of 0.5 lets the signal grow.
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let config = quick_config()
            .with_lmbd(0.1)
            .with_penalty(PenaltyPolicy::Uniform);
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        assert!(model.weights()[0] > 0.5, "signal weight {}", model.weights()[0]);
        assert_eq!(model.weights()[1], 0.0);
        assert_eq!(model.feature_set(), vec![true, false]);
    }

    #[test]
    fn low_prevalence_feature_is_shrunk_first() {
        // Both columns carry the same signal; only their prevalence differs.
        let x = array![
            [1.0, 1.0],
            [1.0, 1.0],
            [0.8, 0.8],
            [1.2, 1.2],
            [-1.0, -1.0],
            [-1.0, -1.0],
            [-0.8, -0.8],
            [-1.2, -1.2]
        ];
        let y = array![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let prevalence = array![1.0, 0.01];
        // Thresholds 0.01 and 1.0: only column 1 sits above every attainable gradient.
        let config = quick_config()
            .with_lmbd(1e-2)
            .with_penalty(PenaltyPolicy::Inverse { floor: 0.01 });
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        assert!(model.weights()[0] > 0.5);
        assert_eq!(model.weights()[1], 0.0);
        assert_eq!(model.feature_set(), vec![true, false]);
    }

    #[test]
    fn loose_tolerance_stops_after_one_step() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let mut config = quick_config();
        config.tol = 1.0;
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        let diagnostics = model.diagnostics();
        assert!(diagnostics.converged);
        assert_eq!(diagnostics.iterations, 1);
        assert_eq!(diagnostics.loss_history.len(), 1);
        assert!(diagnostics.final_displacement < 1.0);
    }

    #[test]
    fn iteration_cap_is_reported_when_not_converged() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let mut config = quick_config().with_max_iter(25);
        config.tol = 1e-300;
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        let diagnostics = model.diagnostics();
        assert!(!diagnostics.converged);
        assert_eq!(diagnostics.iterations, 25);
        assert_eq!(diagnostics.loss_history.len(), 25);
        assert_eq!(diagnostics.displacement_history.len(), 25);
        assert_eq!(
            *diagnostics.displacement_history.last().unwrap(),
            diagnostics.final_displacement
        );
    }

    #[test]
    fn history_can_be_disabled() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let mut config = quick_config().with_max_iter(10);
        config.record_history = false;
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        assert!(model.diagnostics().loss_history.is_empty());
        assert_eq!(model.diagnostics().iterations, 10);
    }

    #[test]
    fn serial_and_threaded_backends_produce_identical_fits() {
        let (x, y) = separable_problem();
        let prevalence = array![1.0, 0.6];
        let config = quick_config().with_lmbd(2e-4);
        let serial = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        let threaded = fit(
            x.view(),
            y.view(),
            prevalence.view(),
            &config.with_device(Device::Threads),
        )
        .unwrap();
        assert_eq!(serial.weights(), threaded.weights());
        assert_eq!(serial.bias(), threaded.bias());
        assert_eq!(serial.diagnostics().iterations, threaded.diagnostics().iterations);
    }

    #[test]
    fn noise_initialization_is_reproducible() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let mut config = quick_config().with_max_iter(50);
        config.init = Initialization::Noise {
            scale: 0.01,
            seed: 11,
        };
        let first = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        let second = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        assert_eq!(first.weights(), second.weights());
    }

    #[test]
    fn overflowing_gradient_is_reported_as_divergence() {
        let big = f64::MAX;
        let x = array![[big], [big], [big], [big], [0.0]];
        let y = array![1.0, 1.0, 1.0, 1.0, 0.0];
        let prevalence = Array1::<f64>::ones(1);
        match fit(x.view(), y.view(), prevalence.view(), &quick_config()) {
            Err(FitError::NumericDivergence { iteration, quantity }) => {
                assert_eq!(iteration, 1);
                assert_eq!(quantity, "gradient");
            }
            other => panic!("expected NumericDivergence, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_design_entries_are_rejected_up_front() {
        let x = array![[1.0, f64::NAN], [0.0, 1.0]];
        let y = array![0.0, 1.0];
        let prevalence = Array1::<f64>::ones(2);
        assert_eq!(
            fit(x.view(), y.view(), prevalence.view(), &quick_config()).unwrap_err(),
            FitError::NonFiniteInput { row: 0, column: 1 }
        );
    }

    #[test]
    fn echo_reports_the_stop_of_a_capped_fit() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let mut config = quick_config().with_max_iter(5);
        config.tol = 1e-300;
        config.echo = true;
        let lines = echoed_during(|| {
            fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        });
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].starts_with("Fit hit max_iter after 5 iterations"), "{}", lines[0]);
        assert!(lines[0].contains("loss = "));
        assert!(lines[0].contains("displacement = "));
    }

    #[test]
    fn echo_reports_the_stop_of_a_diverged_fit() {
        let x = array![[1e308], [-1e308], [1e308], [-1e308]];
        let y = array![1.0, 0.0, 1.0, 0.0];
        let prevalence = Array1::<f64>::ones(1);
        let mut config = quick_config();
        config.echo = true;
        let mut outcome = None;
        let lines = echoed_during(|| {
            outcome = Some(fit(x.view(), y.view(), prevalence.view(), &config));
        });
        assert!(matches!(
            outcome,
            Some(Err(FitError::NumericDivergence { iteration: 1, quantity: "gradient" }))
        ));
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].starts_with("Fit diverged after 1 iterations"), "{}", lines[0]);
        assert!(lines[0].contains("loss = "));
        assert!(lines[0].contains("displacement = "));
    }

    #[test]
    fn silent_fits_echo_nothing() {
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let lines = echoed_during(|| {
            fit(x.view(), y.view(), prevalence.view(), &quick_config().with_max_iter(5)).unwrap();
        });
        assert!(lines.is_empty(), "{lines:?}");
    }

    #[test]
    fn default_tolerance_sits_below_the_normalised_step() {
        // Steps stay near lr while the signal weight keeps growing.
        let (x, y) = separable_problem();
        let prevalence = Array1::<f64>::ones(2);
        let config = SelectorConfig::default().with_max_iter(300);
        let model = fit(x.view(), y.view(), prevalence.view(), &config).unwrap();
        let diagnostics = model.diagnostics();
        assert!(!diagnostics.converged);
        assert_eq!(diagnostics.iterations, 300);
        assert!(diagnostics.final_displacement > config.tol);
        assert!(diagnostics.final_displacement < 10.0 * config.lr);
    }
}
