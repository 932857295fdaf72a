//! A self-contained Gaussian worker for exercising a coordinator end to
//! end without a real experiment behind it.
//!
//! The worker owns a two-parameter Gaussian model (`mu`, `sigma`),
//! generates a deterministic dataset per experiment from its seed, and
//! answers the full request set until the coordinator shuts the
//! connection down.

use std::error::Error;
use std::net::TcpStream;
use std::path::PathBuf;

use clap::Args as ClapArgs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use dfit_core::{FitParameter, FitQuality};
use dfit_wire::{read_frame, write_frame, CoordRequest, WorkerReply};

#[derive(ClapArgs, Debug)]
pub struct WorkerArgs {
    /// Coordinator address to connect to.
    #[arg(long, default_value = "127.0.0.1:9450")]
    connect: String,
    /// Worker id carried in every reply. Ids across the workers of one
    /// run must be unique and cover 0..n.
    #[arg(long)]
    worker_id: u32,
    /// Events generated per experiment.
    #[arg(long, default_value_t = 1000)]
    events: u64,
    /// Master seed; each experiment's dataset derives from it.
    #[arg(long, default_value_t = 3404049)]
    seed: u64,
    /// Constant added to every partial NLL (offsets the objective without
    /// moving the minimum).
    #[arg(long, default_value_t = 0.0)]
    nll_bias: f64,
    /// Optional CSV recording every finalized fit.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Generation-truth values for the toy model.
const GEN_MU: f64 = 0.2;
const GEN_SIGMA: f64 = 1.0;

struct FitRecord {
    quality: FitQuality,
    nll: f64,
    parameters: Vec<FitParameter>,
}

struct ToyWorker<'a> {
    args: &'a WorkerArgs,
    data: Vec<f64>,
    // Cached sufficient statistics: (sum x, sum x^2).
    stats: Option<(f64, f64)>,
    fits: Vec<FitRecord>,
}

pub fn run(args: &WorkerArgs) -> Result<(), Box<dyn Error>> {
    let mut stream = TcpStream::connect(&args.connect)?;
    stream.set_nodelay(true)?;
    info!(connect = %args.connect, worker_id = args.worker_id, "connected to coordinator");

    let mut worker = ToyWorker {
        args,
        data: Vec::new(),
        stats: None,
        fits: Vec::new(),
    };
    loop {
        let request: CoordRequest = match read_frame(&mut stream) {
            Ok(request) => request,
            // Coordinator gone; treat it like a shutdown.
            Err(_) => break,
        };
        let Some(reply) = worker.handle(request)? else {
            break;
        };
        write_frame(&mut stream, &reply)?;
    }
    info!(worker_id = args.worker_id, fits = worker.fits.len(), "worker done");
    Ok(())
}

impl ToyWorker<'_> {
    fn handle(&mut self, request: CoordRequest) -> Result<Option<WorkerReply>, Box<dyn Error>> {
        let worker_id = self.args.worker_id;
        let reply = match request {
            CoordRequest::DeclareParameters => WorkerReply::Parameters {
                worker_id,
                params: self.declarations(),
            },
            CoordRequest::LoadExperiment { expt_id } => {
                self.generate(expt_id);
                info!(expt_id, events = self.data.len(), "experiment generated");
                WorkerReply::Loaded {
                    worker_id,
                    event_count: self.data.len() as u64,
                }
            }
            CoordRequest::Cache => {
                let sum: f64 = self.data.iter().sum();
                let sum_sq: f64 = self.data.iter().map(|x| x * x).sum();
                self.stats = Some((sum, sum_sq));
                WorkerReply::Cached {
                    worker_id,
                    ok: !self.data.is_empty(),
                }
            }
            CoordRequest::Evaluate { values, .. } => WorkerReply::Evaluated {
                worker_id,
                partial_nll: self.nll(&values),
            },
            CoordRequest::SetAsymmErrorMode { enabled } => {
                info!(enabled, "asymmetric-error mode toggled");
                WorkerReply::AsymmErrorMode {
                    worker_id,
                    ack: true,
                }
            }
            CoordRequest::Finalize {
                quality,
                nll,
                parameters,
                ..
            } => {
                self.fits.push(FitRecord {
                    quality,
                    nll,
                    parameters: parameters.clone(),
                });
                WorkerReply::Finalized {
                    worker_id,
                    ok: true,
                    parameters,
                }
            }
            CoordRequest::Persist => {
                let ok = self.persist().is_ok();
                WorkerReply::Persisted { worker_id, ok }
            }
            CoordRequest::Shutdown => return Ok(None),
        };
        Ok(Some(reply))
    }

    fn declarations(&self) -> Vec<FitParameter> {
        let mut mu = FitParameter::new("mu", GEN_MU);
        mu.gen_value = GEN_MU;
        let mut sigma = FitParameter::new("sigma", GEN_SIGMA).with_bounds(0.05, 10.0);
        sigma.gen_value = GEN_SIGMA;
        vec![mu, sigma]
    }

    fn generate(&mut self, expt_id: u32) {
        let seed = self
            .args
            .seed
            .wrapping_add(u64::from(expt_id) << 20)
            .wrapping_add(u64::from(self.args.worker_id));
        let mut rng = StdRng::seed_from_u64(seed);
        self.data = (0..self.args.events)
            .map(|_| GEN_MU + GEN_SIGMA * standard_normal(&mut rng))
            .collect();
        self.stats = None;
    }

    /// Gaussian NLL from the cached sufficient statistics. Values arrive
    /// in declaration order: `[mu, sigma]`.
    fn nll(&mut self, values: &[f64]) -> f64 {
        let [mu, sigma] = values else {
            return f64::NAN;
        };
        if *sigma <= 0.0 {
            return f64::NAN;
        }
        let n = self.data.len() as f64;
        let (sum, sum_sq) = *self.stats.get_or_insert_with(|| {
            let sum: f64 = self.data.iter().sum();
            let sum_sq: f64 = self.data.iter().map(|x| x * x).sum();
            (sum, sum_sq)
        });
        let quadratic = sum_sq - 2.0 * mu * sum + n * mu * mu;
        self.args.nll_bias
            + n * sigma.ln()
            + 0.5 * n * (2.0 * std::f64::consts::PI).ln()
            + quadratic / (2.0 * sigma * sigma)
    }

    fn persist(&self) -> Result<(), Box<dyn Error>> {
        let Some(path) = &self.args.out else {
            return Ok(());
        };
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["quality", "nll", "mu", "mu_err", "sigma", "sigma_err"])?;
        for fit in &self.fits {
            let find = |name: &str| fit.parameters.iter().find(|p| p.name == name);
            let (mu, sigma) = (find("mu"), find("sigma"));
            writer.write_record([
                fit.quality.as_str().to_string(),
                format!("{:.9}", fit.nll),
                mu.map_or_else(String::new, |p| format!("{:.9}", p.value)),
                mu.map_or_else(String::new, |p| format!("{:.9}", p.error)),
                sigma.map_or_else(String::new, |p| format!("{:.9}", p.value)),
                sigma.map_or_else(String::new, |p| format!("{:.9}", p.error)),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Standard normal draw via Box-Muller.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
