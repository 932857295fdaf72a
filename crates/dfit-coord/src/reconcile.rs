//! Parameter reconciliation: merging independently declared worker
//! parameter lists into one canonical global registry.
//!
//! Identity is the parameter name. The first declaration registered wins
//! every disagreement; later declarations only produce warnings. The
//! per-worker index maps built here are stable for the lifetime of the
//! fit.

use tracing::warn;

use dfit_core::FitParameter;

/// Per-worker mapping from worker-local parameter slots to global slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamIndexMap {
    /// Worker-local slot → global parameter index, in the worker's
    /// declared order.
    pub global_slots: Vec<usize>,
}

impl ParamIndexMap {
    /// Global indices of this worker's currently free parameters, in
    /// worker-local order. Computed against the live fixed flags because
    /// two-stage fitting changes them between stages.
    pub fn free_global_slots(&self, global: &[FitParameter]) -> Vec<usize> {
        self.global_slots
            .iter()
            .copied()
            .filter(|&g| !global[g].fixed)
            .collect()
    }

    /// Whether the named parameter belongs to this worker's footprint,
    /// returning its global index.
    pub fn global_slot_of(&self, global: &[FitParameter], name: &str) -> Option<usize> {
        self.global_slots
            .iter()
            .copied()
            .find(|&g| global[g].name == name)
    }
}

/// Registers one worker's declarations into the global list on the first
/// gather, building the worker's index map. Known names reuse their
/// global slot after a warn-only consistency check; unknown names are
/// appended.
pub fn register_first(
    global: &mut Vec<FitParameter>,
    worker_id: u32,
    declared: &[FitParameter],
) -> ParamIndexMap {
    let mut global_slots = Vec::with_capacity(declared.len());
    for param in declared {
        match global.iter().position(|p| p.name == param.name) {
            Some(slot) => {
                warn_mismatches(&global[slot], param, worker_id);
                global_slots.push(slot);
            }
            None => {
                let mut fresh = param.clone();
                fresh.value = fresh.init_value;
                global.push(fresh);
                global_slots.push(global.len() - 1);
            }
        }
    }
    ParamIndexMap { global_slots }
}

/// Applies a later gather: updates `init_value` on already-known
/// parameters after the same consistency check. The parameter set never
/// grows here; unknown names are dropped with a warning.
pub fn refresh_init_values(global: &mut [FitParameter], worker_id: u32, declared: &[FitParameter]) {
    for param in declared {
        match global.iter_mut().find(|p| p.name == param.name) {
            Some(known) => {
                warn_mismatches(known, param, worker_id);
                known.init_value = param.init_value;
            }
            None => {
                warn!(
                    worker_id,
                    name = %param.name,
                    "late parameter declaration ignored: set is closed after the first gather"
                );
            }
        }
    }
}

fn warn_mismatches(registered: &FitParameter, declared: &FitParameter, worker_id: u32) {
    for mismatch in registered.consistency_check(declared) {
        warn!(
            worker_id,
            name = %registered.name,
            field = %mismatch.field,
            registered = %mismatch.registered,
            declared = %mismatch.declared,
            "parameter declaration mismatch: first registered value stays authoritative"
        );
    }
}
