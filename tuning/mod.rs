//! Searching the regularisation strength: the auto-scaler bounds the useful
//! lambda range, the tuner cross-validates a grid inside it, and the sink
//! persists one record per lambda.

pub mod autoscale;
pub mod sink;
pub mod tuner;

pub use autoscale::{AutoScaleConfig, AutoScaleError, AutoScaleResult, auto_scale};
pub use sink::{DirectorySink, MemorySink, SinkError, TuningSink, get_tuning_result};
pub use tuner::{LambdaRecord, TuneConfig, TuneError, TuningResult, tune};
