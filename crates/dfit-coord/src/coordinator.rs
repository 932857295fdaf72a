//! The coordinator: experiment loop, objective evaluation rounds,
//! two-stage fitting and the finalize/persist handshake.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dfit_core::{ConstraintRegistry, DfitError, ErrorInfo, FitParameter, FitStatus};
use dfit_minim::{Minimizer, Objective};
use dfit_wire::{CoordRequest, WorkerReply};

use crate::reconcile::{self, ParamIndexMap};
use crate::results::ResultsWriter;
use crate::session::WorkerPool;
use crate::state::FitState;

/// Fallback returned for a degenerate round before any successful round
/// has established a worst-NLL record.
const DEGENERATE_FALLBACK_NLL: f64 = 1e30;

/// Run-level configuration for a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Total experiment count.
    pub n_expt: u32,
    /// First experiment id; the loop covers `[first_expt, first_expt + n_expt)`.
    pub first_expt: u32,
    /// Whether to run the asymmetric-error scan after each fit.
    pub asymm_errors: bool,
    /// Whether to fit in two stages.
    pub two_stage: bool,
}

/// End-of-run accounting reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Experiments whose final fit reached full covariance quality.
    pub ok_fits: u32,
    /// Experiments whose final fit fell short of full quality.
    pub bad_fits: u32,
    /// Experiments skipped on a zero event count.
    pub skipped: u32,
    /// Total experiments in the run.
    pub n_expt: u32,
    /// OK fits over total experiments, in percent.
    pub efficiency_percent: f64,
}

/// Outcome of the load phase for one experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Every worker reported a nonzero event count.
    Loaded,
    /// A worker reported zero events; the experiment is abandoned.
    Skipped {
        /// First worker that reported zero events.
        worker_id: u32,
    },
}

/// The coordinator. Owns the worker pool, the canonical parameter
/// registry, the minimizer and the fit state; single-threaded from the
/// minimizer's point of view.
pub struct Coordinator<M: Minimizer> {
    pool: WorkerPool,
    minimizer: M,
    params: Vec<FitParameter>,
    declared_fixed: Vec<bool>,
    index_maps: BTreeMap<u32, ParamIndexMap>,
    constraints: ConstraintRegistry,
    results: ResultsWriter,
    state: FitState,
    gathered: bool,
    persisted: bool,
}

impl<M: Minimizer> Coordinator<M> {
    /// Assembles a coordinator from its collaborators.
    pub fn new(
        pool: WorkerPool,
        minimizer: M,
        constraints: ConstraintRegistry,
        results: ResultsWriter,
        config: RunConfig,
    ) -> Self {
        let state = FitState::new(
            config.n_expt,
            config.first_expt,
            config.asymm_errors,
            config.two_stage,
        );
        Self {
            pool,
            minimizer,
            params: Vec::new(),
            declared_fixed: Vec::new(),
            index_maps: BTreeMap::new(),
            constraints,
            results,
            state,
            gathered: false,
            persisted: false,
        }
    }

    /// The canonical global parameter list.
    pub fn params(&self) -> &[FitParameter] {
        &self.params
    }

    /// Current fit bookkeeping.
    pub fn state(&self) -> &FitState {
        &self.state
    }

    /// Per-worker index maps built during the first gather.
    pub fn index_maps(&self) -> &BTreeMap<u32, ParamIndexMap> {
        &self.index_maps
    }

    /// Requests parameter declarations from every worker and reconciles
    /// them into the global registry.
    ///
    /// The first gather builds the registry and the per-worker index
    /// maps, then resolves the constraint registry and fixes the results
    /// table layout. Later gathers only refresh `init_value` on known
    /// parameters; the set never grows again.
    pub fn gather_parameters(&mut self) -> Result<(), DfitError> {
        let n = self.pool.len();
        self.pool.broadcast(&CoordRequest::DeclareParameters)?;
        let mut replies = self.pool.collect(n)?;
        // Deterministic registration order: worker id ascending, then
        // the worker's own declaration order.
        replies.sort_by_key(WorkerReply::worker_id);

        for reply in replies {
            let WorkerReply::Parameters { worker_id, params } = reply else {
                return Err(unexpected_reply("declare-parameters", &reply));
            };
            if self.gathered {
                reconcile::refresh_init_values(&mut self.params, worker_id, &params);
            } else {
                let map = reconcile::register_first(&mut self.params, worker_id, &params);
                self.index_maps.insert(worker_id, map);
            }
        }
        if !self.gathered {
            self.gathered = true;
            self.declared_fixed = self.params.iter().map(|p| p.fixed).collect();
            self.constraints.resolve(&self.params);
            self.results.begin(&self.params)?;
            info!(
                parameters = self.params.len(),
                constraints = self.constraints.terms().len(),
                workers = n,
                "parameter reconciliation complete"
            );
        }
        Ok(())
    }

    /// Resets per-experiment parameter state: fresh start from
    /// `init_value` with declared fixed flags and cleared errors.
    fn reset_for_experiment(&mut self) {
        for (param, &declared) in self.params.iter_mut().zip(&self.declared_fixed) {
            param.fixed = declared;
            param.value = param.init_value;
            param.error = 0.0;
            param.neg_error = 0.0;
            param.pos_error = 0.0;
            param.global_correlation = 0.0;
        }
    }

    /// Broadcasts the load for `expt_id` and collects event counts. Any
    /// worker reporting zero events abandons the experiment.
    pub fn load_experiment(&mut self, expt_id: u32) -> Result<LoadOutcome, DfitError> {
        self.state.current_expt = expt_id;
        let n = self.pool.len();
        self.pool
            .broadcast(&CoordRequest::LoadExperiment { expt_id })?;
        let replies = self.pool.collect(n)?;
        self.state.events_per_worker.clear();
        let mut empty_worker = None;
        for reply in replies {
            let WorkerReply::Loaded {
                worker_id,
                event_count,
            } = reply
            else {
                return Err(unexpected_reply("load-experiment", &reply));
            };
            self.state.events_per_worker.insert(worker_id, event_count);
            if event_count == 0 && empty_worker.is_none() {
                empty_worker = Some(worker_id);
            }
        }
        if let Some(worker_id) = empty_worker {
            warn!(expt_id, worker_id, "worker reported zero events, skipping experiment");
            self.state.skipped += 1;
            return Ok(LoadOutcome::Skipped { worker_id });
        }
        Ok(LoadOutcome::Loaded)
    }

    /// Broadcasts the cache/prepare phase and requires success from
    /// every worker.
    pub fn cache(&mut self) -> Result<(), DfitError> {
        let n = self.pool.len();
        self.pool.broadcast(&CoordRequest::Cache)?;
        for reply in self.pool.collect(n)? {
            let WorkerReply::Cached { worker_id, ok } = reply else {
                return Err(unexpected_reply("cache", &reply));
            };
            if !ok {
                return Err(DfitError::Config(
                    ErrorInfo::new("cache-failed", "worker could not prepare its model cache")
                        .with_context("worker_id", worker_id.to_string())
                        .with_context("expt_id", self.state.current_expt.to_string()),
                ));
            }
        }
        Ok(())
    }

    /// Runs the full fit for the current experiment: stage 1, and, when
    /// two-stage fitting is enabled and stage 1 reaches full quality,
    /// the released stage 2 warm-started from the stage-1 optimum.
    pub fn fit_experiment(&mut self) -> Result<FitStatus, DfitError> {
        // Initialise from the declared flags so the minimizer can restore
        // them when stage 2 releases; only then fix the second-stage set
        // on both sides.
        self.minimizer.initialise(&self.params)?;
        if self.state.two_stage {
            self.minimizer.fix_second_stage();
            for param in &mut self.params {
                if param.second_stage {
                    param.fixed = true;
                }
            }
        }

        let stage1 = self.run_minimisation()?;
        if !self.state.two_stage {
            return Ok(stage1);
        }
        if !stage1.quality.is_full() {
            warn!(
                expt_id = self.state.current_expt,
                quality = stage1.quality.as_str(),
                "stage 1 not full quality, skipping stage 2; second-stage parameters stay fixed"
            );
            return Ok(stage1);
        }

        for (param, &declared) in self.params.iter_mut().zip(&self.declared_fixed) {
            if param.second_stage {
                param.fixed = declared;
            }
        }
        self.minimizer.release_second_stage();
        // Warm start: the minimizer keeps the stage-1 optimum as its
        // starting point.
        self.run_minimisation()
    }

    /// One minimisation attempt. The worst-NLL record backing the
    /// degenerate-round fallback resets here, once per attempt.
    fn run_minimisation(&mut self) -> Result<FitStatus, DfitError> {
        self.state.reset_worst_nll();
        let n_free = free_slots(&self.params).len();
        let status = {
            let mut objective = RoundObjective {
                pool: &mut self.pool,
                params: &mut self.params,
                index_maps: &self.index_maps,
                constraints: &self.constraints,
                worst_nll: &mut self.state.worst_nll,
                n_free,
            };
            self.minimizer.minimise(&mut objective)?
        };
        self.minimizer.update_parameters(&mut self.params);
        Ok(status)
    }

    /// Installs free-parameter values exactly as the minimizer would.
    /// Exposed for direct protocol exercises; [`Coordinator::run`] never
    /// needs it.
    pub fn set_free_parameters(
        &mut self,
        values: &[f64],
        asymm_exempt: bool,
    ) -> Result<(), DfitError> {
        let n_free = free_slots(&self.params).len();
        let mut objective = RoundObjective {
            pool: &mut self.pool,
            params: &mut self.params,
            index_maps: &self.index_maps,
            constraints: &self.constraints,
            worst_nll: &mut self.state.worst_nll,
            n_free,
        };
        objective.set_parameters(values, asymm_exempt)
    }

    /// Runs one distributed objective round at the currently installed
    /// parameter values. Exposed for direct protocol exercises.
    pub fn evaluate_round(&mut self) -> Result<f64, DfitError> {
        let n_free = free_slots(&self.params).len();
        let mut objective = RoundObjective {
            pool: &mut self.pool,
            params: &mut self.params,
            index_maps: &self.index_maps,
            constraints: &self.constraints,
            worst_nll: &mut self.state.worst_nll,
            n_free,
        };
        objective.eval()
    }

    /// Sends each worker its slice of the fit outcome and merges the
    /// finalized parameter values back into the global registry, then
    /// appends the experiment's results row.
    pub fn finalize(&mut self, status: &FitStatus) -> Result<(), DfitError> {
        let free_global = free_slots(&self.params);
        for (&worker_id, map) in &self.index_maps {
            let worker_free = map.free_global_slots(&self.params);
            let mut rows = Vec::with_capacity(worker_free.len());
            for g in &worker_free {
                let row = free_global.iter().position(|fg| fg == g).ok_or_else(|| {
                    DfitError::Config(ErrorInfo::new(
                        "free-slot-inconsistency",
                        "worker free slot missing from the global free list",
                    ))
                })?;
                rows.push(row);
            }
            let covariance: Vec<Vec<f64>> = rows
                .iter()
                .map(|&ri| rows.iter().map(|&rj| status.covariance[(ri, rj)]).collect())
                .collect();
            let parameters: Vec<FitParameter> = map
                .global_slots
                .iter()
                .map(|&g| self.params[g].clone())
                .collect();
            self.pool.send_to_worker(
                worker_id,
                &CoordRequest::Finalize {
                    quality: status.quality,
                    nll: status.nll,
                    edm: status.edm,
                    parameters,
                    covariance,
                },
            )?;
        }

        let n = self.pool.len();
        for reply in self.pool.collect(n)? {
            let WorkerReply::Finalized {
                worker_id,
                ok,
                parameters,
            } = reply
            else {
                return Err(unexpected_reply("finalize", &reply));
            };
            if !ok {
                return Err(DfitError::Config(
                    ErrorInfo::new("finalize-failed", "worker rejected the finalize payload")
                        .with_context("worker_id", worker_id.to_string()),
                ));
            }
            let map = self.index_maps.get(&worker_id).ok_or_else(|| {
                DfitError::Protocol(
                    ErrorInfo::new("finalize-unknown-worker", "finalize reply from unknown worker")
                        .with_context("worker_id", worker_id.to_string()),
                )
            })?;
            // Merge by name, never by position: workers may not reorder
            // the global registry.
            for finalized in parameters {
                let slot = map
                    .global_slot_of(&self.params, &finalized.name)
                    .ok_or_else(|| {
                        DfitError::Config(
                            ErrorInfo::new(
                                "finalize-name-mismatch",
                                "finalized parameter name outside the worker's footprint",
                            )
                            .with_context("worker_id", worker_id.to_string())
                            .with_context("name", finalized.name.clone()),
                        )
                    })?;
                self.params[slot].value = finalized.value;
            }
        }

        let free_names: Vec<String> = free_global
            .iter()
            .map(|&g| self.params[g].name.clone())
            .collect();
        self.results
            .append_row(self.state.current_expt, status, &self.params, &free_names)
    }

    /// Broadcasts the persist instruction and flushes the local results
    /// table. One-shot and idempotent.
    pub fn write_out_results(&mut self) -> Result<(), DfitError> {
        if self.persisted {
            return Ok(());
        }
        self.persisted = true;
        let n = self.pool.len();
        self.pool.broadcast(&CoordRequest::Persist)?;
        for reply in self.pool.collect(n)? {
            let WorkerReply::Persisted { worker_id, ok } = reply else {
                return Err(unexpected_reply("persist", &reply));
            };
            if !ok {
                warn!(worker_id, "worker reported a failed persist");
            }
        }
        self.results.finish()
    }

    /// Shuts the worker pool down. Idempotent.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }

    /// Drives the whole run: per experiment, gather, load, cache, fit,
    /// finalize; then persist and shut down.
    pub fn run(&mut self) -> Result<RunSummary, DfitError> {
        let first = self.state.first_expt;
        let count = self.state.n_expt;
        for expt_id in first..first.saturating_add(count) {
            self.gather_parameters()?;
            self.reset_for_experiment();
            match self.load_experiment(expt_id)? {
                LoadOutcome::Skipped { .. } => continue,
                LoadOutcome::Loaded => {}
            }
            self.cache()?;
            let status = self.fit_experiment()?;
            self.finalize(&status)?;
            if status.quality.is_full() {
                self.state.ok_fits += 1;
            } else {
                self.state.bad_fits += 1;
            }
            info!(
                expt_id,
                quality = status.quality.as_str(),
                nll = status.nll,
                "experiment complete"
            );
        }
        self.write_out_results()?;
        self.pool.shutdown();
        Ok(RunSummary {
            ok_fits: self.state.ok_fits,
            bad_fits: self.state.bad_fits,
            skipped: self.state.skipped,
            n_expt: self.state.n_expt,
            efficiency_percent: self.state.efficiency_percent(),
        })
    }
}

/// Global indices of the currently free parameters.
fn free_slots(params: &[FitParameter]) -> Vec<usize> {
    params
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.fixed)
        .map(|(i, _)| i)
        .collect()
}

fn unexpected_reply(phase: &str, reply: &WorkerReply) -> DfitError {
    DfitError::Protocol(
        ErrorInfo::new("unexpected-reply", "reply kind does not match the round")
            .with_context("phase", phase.to_string())
            .with_context("worker_id", reply.worker_id().to_string()),
    )
}

/// The coordinator side of the minimizer's objective contract. Borrows
/// the round-relevant coordinator state so the minimizer can probe while
/// the coordinator owns everything between rounds.
struct RoundObjective<'a> {
    pool: &'a mut WorkerPool,
    params: &'a mut Vec<FitParameter>,
    index_maps: &'a BTreeMap<u32, ParamIndexMap>,
    constraints: &'a ConstraintRegistry,
    worst_nll: &'a mut f64,
    n_free: usize,
}

impl Objective for RoundObjective<'_> {
    fn set_parameters(&mut self, values: &[f64], asymm_exempt: bool) -> Result<(), DfitError> {
        if !asymm_exempt && values.len() != self.n_free {
            // Corrupted minimizer-to-model indexing; continuing would
            // scatter values onto the wrong parameters.
            return Err(DfitError::Config(
                ErrorInfo::new(
                    "free-count-mismatch",
                    "supplied value count does not match the free parameter count",
                )
                .with_context("expected", self.n_free.to_string())
                .with_context("supplied", values.len().to_string()),
            ));
        }
        let free: Vec<usize> = self
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.fixed)
            .map(|(i, _)| i)
            .collect();
        for (&slot, &value) in free.iter().zip(values) {
            self.params[slot].value = value;
        }
        Ok(())
    }

    fn eval(&mut self) -> Result<f64, DfitError> {
        let n_total = self.params.len() as u32;
        let n_free = self.n_free as u32;
        // Scatter: all sends complete before any receive.
        for (&worker_id, map) in self.index_maps {
            let values: Vec<f64> = map
                .global_slots
                .iter()
                .map(|&g| self.params[g].value)
                .collect();
            self.pool.send_to_worker(
                worker_id,
                &CoordRequest::Evaluate {
                    n_total,
                    n_free,
                    values,
                },
            )?;
        }

        let mut total = 0.0;
        let mut degenerate = false;
        for reply in self.pool.collect(self.index_maps.len())? {
            let WorkerReply::Evaluated {
                worker_id,
                partial_nll,
            } = reply
            else {
                return Err(unexpected_reply("evaluate", &reply));
            };
            if partial_nll == 0.0 || !partial_nll.is_finite() {
                warn!(worker_id, partial_nll, "degenerate partial likelihood");
                degenerate = true;
            } else {
                total += partial_nll;
            }
        }

        if degenerate {
            // Steer the minimizer away from the pathological region with
            // the worst value of this attempt; the record itself is not
            // updated by a degenerate round.
            let fallback = if self.worst_nll.is_finite() {
                *self.worst_nll
            } else {
                DEGENERATE_FALLBACK_NLL
            };
            return Ok(fallback);
        }

        let global_values: Vec<f64> = self.params.iter().map(|p| p.value).collect();
        total += self.constraints.total_penalty(&global_values);
        if total > *self.worst_nll {
            *self.worst_nll = total;
        }
        Ok(total)
    }

    fn set_asymm_error_mode(&mut self, enabled: bool) -> Result<(), DfitError> {
        let n = self.pool.len();
        self.pool
            .broadcast(&CoordRequest::SetAsymmErrorMode { enabled })?;
        for reply in self.pool.collect(n)? {
            let WorkerReply::AsymmErrorMode { worker_id, ack } = reply else {
                return Err(unexpected_reply("asymm-error-mode", &reply));
            };
            if !ack {
                return Err(DfitError::Protocol(
                    ErrorInfo::new("asymm-mode-rejected", "worker rejected asymmetric-error mode")
                        .with_context("worker_id", worker_id.to_string()),
                ));
            }
        }
        Ok(())
    }
}
