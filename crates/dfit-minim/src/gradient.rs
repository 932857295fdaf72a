//! First pass: preconditioned steepest descent with backtracking line
//! search in internal coordinates.

use dfit_core::DfitError;
use nalgebra::DVector;

use crate::minimizer::FreeEval;
use crate::MinimizerConfig;

/// Armijo sufficient-decrease constant.
const ARMIJO_C: f64 = 1e-4;
/// Maximum step halvings per line search.
const MAX_BACKTRACKS: usize = 40;

/// Result of the descent pass.
pub(crate) struct DescentOutcome {
    /// Internal coordinates at the best point found.
    pub u: DVector<f64>,
    /// Objective value at `u`.
    pub f: f64,
    /// Estimated distance to minimum when the pass ended.
    pub edm: f64,
    /// Iterations consumed.
    pub iterations: usize,
    /// Whether the edm threshold was reached.
    pub converged: bool,
}

/// Forward-difference gradient at `u`, reusing the already-known `f0`.
pub(crate) fn forward_gradient(
    eval: &mut FreeEval<'_>,
    u: &DVector<f64>,
    f0: f64,
    steps: &DVector<f64>,
) -> Result<DVector<f64>, DfitError> {
    let n = u.len();
    let mut grad = DVector::zeros(n);
    for i in 0..n {
        let h = steps[i];
        let mut probe = u.clone();
        probe[i] += h;
        let f_plus = eval.eval(&probe)?;
        grad[i] = (f_plus - f0) / h;
    }
    Ok(grad)
}

/// Runs the descent until the estimated distance to minimum drops below
/// the configured tolerance, the line search stalls, or the iteration cap
/// is hit. The per-parameter steps act as a diagonal preconditioner so a
/// yield and a mass with wildly different scales descend together.
pub(crate) fn descend(
    eval: &mut FreeEval<'_>,
    u0: DVector<f64>,
    steps: &DVector<f64>,
    config: &MinimizerConfig,
) -> Result<DescentOutcome, DfitError> {
    let mut u = u0;
    let mut f = eval.eval(&u)?;
    let mut edm = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        iterations += 1;
        let grad = forward_gradient(eval, &u, f, steps)?;
        let direction: DVector<f64> = -grad.component_mul(&steps.component_mul(steps));
        let predicted_decrease = -grad.dot(&direction);
        edm = 0.5 * predicted_decrease.abs();
        if edm < config.tolerance {
            converged = true;
            break;
        }

        let mut alpha = 1.0;
        let mut accepted = false;
        for _ in 0..MAX_BACKTRACKS {
            let trial = &u + &direction * alpha;
            let f_trial = eval.eval(&trial)?;
            if f_trial <= f - ARMIJO_C * alpha * predicted_decrease {
                u = trial;
                f = f_trial;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        if !accepted {
            // Objective is flat at this resolution; treat the predicted
            // decrease as the remaining distance and stop.
            break;
        }
    }

    Ok(DescentOutcome {
        u,
        f,
        edm,
        iterations,
        converged,
    })
}
