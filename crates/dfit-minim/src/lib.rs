#![deny(missing_docs)]
//! Minimizer contract and the concrete gradient minimizer used by the
//! dfit coordinator.
//!
//! The coordinator sits behind the [`Objective`] trait: the minimizer
//! calls [`Objective::set_parameters`] followed by [`Objective::eval`] on
//! every probe, and the coordinator turns each probe into one distributed
//! evaluation round. The [`Minimizer`] trait is the seam the coordinator
//! drives; [`GradientMinimizer`] is the one concrete binding.

use dfit_core::{DfitError, FitParameter, FitStatus};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

mod gradient;
mod hessian;
mod minimizer;
mod scan;
mod transform;

pub use minimizer::{GradientMinimizer, DEFAULT_ABSOLUTE_STEP, DEFAULT_RELATIVE_ERROR};
pub use transform::BoundTransform;

/// The objective function contract the coordinator satisfies.
///
/// One `set_parameters` + `eval` pair is one minimizer probe. The
/// coordinator may be probed only sequentially; the minimizer never
/// issues overlapping evaluations.
pub trait Objective {
    /// Installs the free-parameter values for the next evaluation.
    ///
    /// `values` holds one entry per free global parameter in free-slot
    /// order. `asymm_exempt` must be true exactly while an
    /// asymmetric-error scan is running; it lifts the free-parameter
    /// count check, which is otherwise configuration-fatal on mismatch.
    fn set_parameters(&mut self, values: &[f64], asymm_exempt: bool) -> Result<(), DfitError>;

    /// Computes the total negative log-likelihood at the installed values.
    fn eval(&mut self) -> Result<f64, DfitError>;

    /// Announces entry into or exit from an asymmetric-error scan so the
    /// objective can inform its workers.
    fn set_asymm_error_mode(&mut self, enabled: bool) -> Result<(), DfitError>;
}

/// Contract between the coordinator and an iterative minimizer.
pub trait Minimizer {
    /// Installs the parameter set for the coming fit. Applies the
    /// default-error rule for parameters declared without an error.
    fn initialise(&mut self, params: &[FitParameter]) -> Result<(), DfitError>;

    /// Runs the minimisation passes and returns the fit outcome.
    fn minimise(&mut self, objective: &mut dyn Objective) -> Result<FitStatus, DfitError>;

    /// Fixes every parameter marked second-stage (stage-1 preparation).
    fn fix_second_stage(&mut self);

    /// Releases every parameter marked second-stage back to its declared
    /// fixed flag (stage-2 preparation).
    fn release_second_stage(&mut self);

    /// Writes final values, errors and global correlations back into the
    /// caller's parameter list, matched by name.
    fn update_parameters(&self, params: &mut [FitParameter]);

    /// Covariance over the free parameters produced by the last
    /// minimisation, in free-slot order.
    fn covariance_matrix(&self) -> &DMatrix<f64>;

    /// Number of free (unfixed) parameters as the minimizer currently
    /// sees them.
    fn free_parameter_count(&self) -> usize;
}

/// Tunables for [`GradientMinimizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizerConfig {
    /// Estimated-distance-to-minimum threshold ending the gradient pass.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Iteration cap for the gradient pass.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Whether to run the per-parameter asymmetric-error scan after the
    /// curvature pass.
    #[serde(default)]
    pub asymm_errors: bool,
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_iterations() -> usize {
    500
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            asymm_errors: false,
        }
    }
}
