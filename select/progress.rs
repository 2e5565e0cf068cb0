use std::fmt;

/// Phases reported while searching the lambda space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TuneProgressStage {
    AutoScale,
    CrossValidation,
}

impl TuneProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::AutoScale => "lambda range sweep",
            Self::CrossValidation => "cross-validated lambda tuning",
        }
    }
}

impl fmt::Display for TuneProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress over a lambda grid, one callback per lambda.
pub trait TuneProgressObserver {
    fn on_stage_start(&mut self, stage: TuneProgressStage, total_lambdas: usize) {
        let _ = (stage, total_lambdas);
    }
    fn on_lambda_finished(&mut self, stage: TuneProgressStage, lambda: f64, completed: usize) {
        let _ = (stage, lambda, completed);
    }
    fn on_stage_finish(&mut self, stage: TuneProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopTuneProgress;

impl TuneProgressObserver for NoopTuneProgress {}
