use std::error::Error;
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dfit_coord::results::ResultsWriter;
use dfit_coord::{Coordinator, RunConfig, WorkerPool};
use dfit_core::{ConstraintRegistry, ConstraintSpec};
use dfit_minim::{GradientMinimizer, MinimizerConfig};

mod toy_worker;

#[derive(Parser, Debug)]
#[command(name = "dfit", about = "Distributed likelihood-fit coordinator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator: accept workers, fit every experiment, write
    /// the results table.
    Run(RunArgs),
    /// Run a toy Gaussian worker against a coordinator (for local
    /// exercising of the protocol).
    Worker(toy_worker::WorkerArgs),
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Number of worker connections to wait for.
    #[arg(long)]
    workers: usize,
    /// Listen address for worker connections.
    #[arg(long, default_value = "127.0.0.1:9450")]
    bind: String,
    /// Number of experiments to fit.
    #[arg(long, default_value_t = 1)]
    n_expt: u32,
    /// First experiment id.
    #[arg(long, default_value_t = 0)]
    first_expt: u32,
    /// Run the asymmetric-error scan after each fit.
    #[arg(long)]
    asymm_errors: bool,
    /// Fit in two stages, releasing second-stage parameters only after a
    /// full-quality first stage.
    #[arg(long)]
    two_stage: bool,
    /// Output CSV path for the per-experiment results table.
    #[arg(long, default_value = "results.csv")]
    out: PathBuf,
    /// Optional YAML file declaring Gaussian constraints.
    #[arg(long)]
    constraints: Option<PathBuf>,
    /// Estimated-distance-to-minimum convergence threshold.
    #[arg(long, default_value_t = 1e-6)]
    tolerance: f64,
    /// Iteration cap for the gradient pass.
    #[arg(long, default_value_t = 500)]
    max_iterations: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_coordinator(args),
        Command::Worker(args) => toy_worker::run(&args),
    }
}

fn run_coordinator(args: RunArgs) -> Result<(), Box<dyn Error>> {
    if args.workers == 0 {
        return Err("--workers must be at least 1".into());
    }
    let constraints = load_constraints(args.constraints.as_deref())?;

    let listener = TcpListener::bind(&args.bind)?;
    info!(bind = %args.bind, workers = args.workers, "waiting for workers");
    let pool = WorkerPool::accept(&listener, args.workers)?;

    let minimizer = GradientMinimizer::new(MinimizerConfig {
        tolerance: args.tolerance,
        max_iterations: args.max_iterations,
        asymm_errors: args.asymm_errors,
    });
    let results = ResultsWriter::create(&args.out);
    let config = RunConfig {
        n_expt: args.n_expt,
        first_expt: args.first_expt,
        asymm_errors: args.asymm_errors,
        two_stage: args.two_stage,
    };
    let mut coordinator = Coordinator::new(pool, minimizer, constraints, results, config);
    let summary = coordinator.run()?;

    println!("OK fits:     {}", summary.ok_fits);
    println!("Bad fits:    {}", summary.bad_fits);
    println!("Skipped:     {}", summary.skipped);
    println!("Efficiency:  {:.1}%", summary.efficiency_percent);
    println!("Results:     {}", args.out.display());
    Ok(())
}

fn load_constraints(path: Option<&std::path::Path>) -> Result<ConstraintRegistry, Box<dyn Error>> {
    let mut registry = ConstraintRegistry::new();
    let Some(path) = path else {
        return Ok(registry);
    };
    let contents = fs::read_to_string(path)?;
    let specs: Vec<ConstraintSpec> = serde_yaml::from_str(&contents)?;
    for spec in specs {
        registry.declare(spec);
    }
    info!(path = %path.display(), declared = registry.declared_count(), "constraints loaded");
    Ok(registry)
}
