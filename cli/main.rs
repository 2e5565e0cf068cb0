#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use prevalent::backend::Device;
use prevalent::prevalence::{NonzeroFrequency, PrevalenceProvider};
use prevalent::progress::{TuneProgressObserver, TuneProgressStage};
use prevalent::shared::files::{
    FeatureMatrix, align_labels, check_same_layout, read_labels, read_matrix, write_selection_list,
};
use prevalent::tuning::{
    AutoScaleConfig, DirectorySink, TuneConfig, TuningResult, auto_scale, get_tuning_result, tune,
};
use prevalent::{SelectorConfig, fit};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Args)]
pub struct InputArgs {
    /// Normalised samples × features TSV used for fitting
    #[arg(long, value_name = "PATH")]
    pub matrix: PathBuf,

    /// Raw count TSV used for prevalence (defaults to --matrix)
    #[arg(long, value_name = "PATH")]
    pub raw: Option<PathBuf>,

    /// Two-column TSV of sample identifiers and labels
    #[arg(long, value_name = "PATH")]
    pub labels: PathBuf,

    /// Raw values at or below this magnitude count as absent
    #[arg(long, default_value = "0")]
    pub baseline: f64,
}

#[derive(Args)]
pub struct SelectorArgs {
    /// Selector configuration file (.toml); flags below take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub max_iter: Option<usize>,

    #[arg(long)]
    pub tol: Option<f64>,

    #[arg(long)]
    pub lr: Option<f64>,

    /// Compute target: cpu or threads
    #[arg(long)]
    pub device: Option<Device>,

    /// Report how each fit stopped
    #[arg(long)]
    pub echo: bool,
}

#[derive(Args)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub selector: SelectorArgs,

    /// Regularization strength
    #[arg(long)]
    pub lmbd: Option<f64>,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub out: PathBuf,

    /// Optional selection list output (feature, weight, tendency)
    #[arg(long, value_name = "PATH")]
    pub selection: Option<PathBuf>,
}

#[derive(Args)]
pub struct AutoScaleArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub selector: SelectorArgs,

    /// Number of lambdas to return between the onset and collapse boundaries
    #[arg(long, default_value = "10")]
    pub step: usize,

    #[arg(long, default_value = "-10", allow_hyphen_values = true)]
    pub log10_min: i32,

    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub log10_max: i32,

    #[arg(long, default_value = "1")]
    pub points_per_decade: usize,

    /// Bisection fits used to narrow the collapse boundary below its grid point
    #[arg(long, default_value = "8")]
    pub refine_steps: usize,
}

#[derive(Args)]
pub struct TuneArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub selector: SelectorArgs,

    /// Comma-separated lambda grid
    #[arg(long, value_delimiter = ',', conflicts_with = "auto", required_unless_present = "auto")]
    pub lambdas: Vec<f64>,

    /// Derive a grid of this many lambdas with the auto-scaler first
    #[arg(long, value_name = "STEP")]
    pub auto: Option<usize>,

    #[arg(long, default_value = "5")]
    pub folds: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Plain k-partition instead of stratified folds
    #[arg(long)]
    pub unstratified: bool,

    /// Run folds one after another
    #[arg(long)]
    pub serial: bool,

    /// Skip lambdas already written to --out
    #[arg(long)]
    pub resume: bool,

    /// Output directory for per-lambda records
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "prevalent",
    version,
    about = "Prevalence-aware sparse logistic feature selection",
    long_about = "Fits an L1-penalised logistic model whose per-feature shrinkage grows as \
                 feature prevalence falls, and searches the regularization strength with an \
                 auto-scaler and k-fold cross-validation."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit one model at a fixed lambda
    #[command(about = "Fit a model (outputs: model.toml)")]
    Fit(FitArgs),

    /// Bound the useful lambda range
    #[command(about = "Find the onset and collapse lambdas")]
    Autoscale(AutoScaleArgs),

    /// Cross-validate a lambda grid
    #[command(about = "Tune lambda by k-fold cross-validation (outputs: one JSON record per lambda)")]
    Tune(TuneArgs),

    /// Summarise a finished or interrupted tuning run
    #[command(name = "result", about = "Print the records of a tuning output directory")]
    Report {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

struct Inputs {
    input: FeatureMatrix,
    raw: FeatureMatrix,
    labels: ndarray::Array1<f64>,
}

fn load_inputs(args: &InputArgs) -> Result<Inputs, Box<dyn std::error::Error>> {
    println!("Loading feature matrix from: {}", args.matrix.display());
    let input = read_matrix(&args.matrix)?;
    let raw = match &args.raw {
        Some(path) => {
            println!("Loading raw counts from: {}", path.display());
            let raw = read_matrix(path)?;
            check_same_layout(&input, &raw)?;
            raw
        }
        None => input.clone(),
    };
    let labels = align_labels(&input, &read_labels(&args.labels)?)?;
    println!(
        "Loaded {} samples with {} features",
        input.sample_ids.len(),
        input.feature_names.len()
    );
    Ok(Inputs { input, raw, labels })
}

fn selector_config(args: &SelectorArgs) -> Result<SelectorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SelectorConfig::load(path)?,
        None => SelectorConfig::default(),
    };
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    if let Some(tol) = args.tol {
        config.tol = tol;
    }
    if let Some(lr) = args.lr {
        config.lr = lr;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    config.echo |= args.echo;
    config.validate()?;
    Ok(config)
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Drives one progress bar per stage.
#[derive(Default)]
struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl TuneProgressObserver for TerminalProgress {
    fn on_stage_start(&mut self, stage: TuneProgressStage, total_lambdas: usize) {
        self.bar = Some(create_progress_bar(total_lambdas as u64, stage.describe()));
    }

    fn on_lambda_finished(&mut self, stage: TuneProgressStage, lambda: f64, completed: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            bar.set_message(format!("{stage}: lambda {lambda:.3e}"));
        }
    }

    fn on_stage_finish(&mut self, stage: TuneProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

fn run_fit(args: FitArgs) -> CliResult {
    let data = load_inputs(&args.input)?;
    let mut config = selector_config(&args.selector)?;
    if let Some(lmbd) = args.lmbd {
        config = config.with_lmbd(lmbd);
    }
    let rows: Vec<usize> = (0..data.raw.values.nrows()).collect();
    let provider = NonzeroFrequency {
        baseline: args.input.baseline,
    };
    let prevalence = provider.prevalence(data.raw.values.view(), &rows);

    println!("Fitting at lambda {:.3e}...", config.lmbd);
    let model = fit(
        data.input.values.view(),
        data.labels.view(),
        prevalence.view(),
        &config,
    )?;
    let diagnostics = model.diagnostics();
    println!(
        "Stopped after {} iterations ({}), loss {:.6e}, displacement {:.6e}",
        diagnostics.iterations,
        if diagnostics.converged {
            "converged"
        } else {
            "iteration cap"
        },
        diagnostics.final_loss,
        diagnostics.final_displacement
    );
    println!(
        "Selected {} of {} features; label {} is the positive class",
        model.selected_count(),
        model.n_features(),
        model.classes().positive
    );

    model.save(&args.out)?;
    println!("Model saved to: {}", args.out.display());
    if let Some(path) = &args.selection {
        let written = write_selection_list(path, &model, &data.input.feature_names)?;
        println!("Selection list ({written} features) saved to: {}", path.display());
    }
    Ok(())
}

fn run_autoscale(args: AutoScaleArgs) -> CliResult {
    let data = load_inputs(&args.input)?;
    let config = selector_config(&args.selector)?;
    let scale = AutoScaleConfig {
        log10_min: args.log10_min,
        log10_max: args.log10_max,
        points_per_decade: args.points_per_decade,
        refine_steps: args.refine_steps,
    };
    let result = auto_scale(
        data.input.values.view(),
        data.raw.values.view(),
        data.labels.view(),
        args.step,
        &config,
        &scale,
        &NonzeroFrequency {
            baseline: args.input.baseline,
        },
        &mut TerminalProgress::default(),
    )?;
    for (lambda, count) in result.sweep.iter().chain(&result.refinement) {
        println!("lambda {lambda:.3e}\t{count} features");
    }
    println!(
        "Onset {:.3e}, collapse {:.3e}",
        result.onset, result.collapse
    );
    let lambdas: Vec<String> = result.lambdas().iter().map(|l| format!("{l:.6e}")).collect();
    println!("Suggested grid: {}", lambdas.join(","));
    Ok(())
}

fn run_tune(args: TuneArgs) -> CliResult {
    let data = load_inputs(&args.input)?;
    let selector = selector_config(&args.selector)?;
    let provider = NonzeroFrequency {
        baseline: args.input.baseline,
    };
    let mut progress = TerminalProgress::default();

    let lambdas = match args.auto {
        Some(step) => auto_scale(
            data.input.values.view(),
            data.raw.values.view(),
            data.labels.view(),
            step,
            &selector,
            &AutoScaleConfig::default(),
            &provider,
            &mut progress,
        )?
        .lambdas(),
        None => args.lambdas.clone(),
    };

    let config = TuneConfig {
        k: args.folds,
        seed: args.seed,
        stratified: !args.unstratified,
        parallel: !args.serial,
        resume: args.resume,
    };
    let mut sink = DirectorySink::create(&args.out)?;
    let result = tune(
        data.input.values.view(),
        data.raw.values.view(),
        data.labels.view(),
        &lambdas,
        &selector,
        &config,
        &provider,
        &mut sink,
        &mut progress,
    )?;
    print_result(&result);
    println!("Records saved to: {}", args.out.display());
    Ok(())
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.4}"))
}

fn print_result(result: &TuningResult) {
    println!("lambda\tfeatures\tauc\taupr\tmcc\tpairwise_mcc\tfailed_folds");
    for record in result.records() {
        println!(
            "{:.6e}\t{}\t{}\t{}\t{}\t{}\t{}",
            record.lambda,
            format_metric(record.feature_count),
            format_metric(record.auc),
            format_metric(record.aupr),
            format_metric(record.mcc),
            format_metric(record.pairwise_mcc),
            record.failed_folds
        );
    }
    if let Some(best) = result.best_by_auc() {
        println!(
            "Best mean AUC {} at lambda {:.6e}",
            format_metric(best.auc),
            best.lambda
        );
    }
}

fn run_result(dir: PathBuf) -> CliResult {
    let result = get_tuning_result(&dir)?;
    print_result(&result);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Autoscale(args)) => run_autoscale(args),
        Some(Commands::Tune(args)) => run_tune(args),
        Some(Commands::Report { dir }) => run_result(dir),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
