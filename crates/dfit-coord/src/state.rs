//! Run-level fit bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Explicit counters and flags owned by the coordinator, reset at
/// well-defined lifecycle points: counters at run start, the worst-NLL
/// record at the start of each minimisation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitState {
    /// Total number of experiments in the run.
    pub n_expt: u32,
    /// First experiment id.
    pub first_expt: u32,
    /// Experiment currently being processed.
    pub current_expt: u32,
    /// Event counts reported by each worker for the current experiment.
    pub events_per_worker: BTreeMap<u32, u64>,
    /// Experiments whose final fit reached full covariance quality.
    pub ok_fits: u32,
    /// Experiments whose final fit fell short of full quality.
    pub bad_fits: u32,
    /// Experiments abandoned because a worker reported zero events.
    pub skipped: u32,
    /// Largest total NLL seen in a successful round of the current
    /// minimisation attempt; the degenerate-round fallback value.
    #[serde(skip, default = "neg_infinity")]
    pub worst_nll: f64,
    /// Whether asymmetric errors were requested for this run.
    pub asymm_errors: bool,
    /// Whether two-stage fitting is enabled for this run.
    pub two_stage: bool,
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

impl FitState {
    /// Fresh state at run start.
    pub fn new(n_expt: u32, first_expt: u32, asymm_errors: bool, two_stage: bool) -> Self {
        Self {
            n_expt,
            first_expt,
            current_expt: first_expt,
            events_per_worker: BTreeMap::new(),
            ok_fits: 0,
            bad_fits: 0,
            skipped: 0,
            worst_nll: f64::NEG_INFINITY,
            asymm_errors,
            two_stage,
        }
    }

    /// Resets the degenerate-round fallback record. Called at the start
    /// of every minimisation attempt, including the second stage of a
    /// two-stage fit.
    pub fn reset_worst_nll(&mut self) {
        self.worst_nll = f64::NEG_INFINITY;
    }

    /// Fraction of experiments that produced a full-quality fit, as a
    /// percentage over all attempted experiments.
    pub fn efficiency_percent(&self) -> f64 {
        if self.n_expt == 0 {
            0.0
        } else {
            100.0 * f64::from(self.ok_fits) / f64::from(self.n_expt)
        }
    }
}
