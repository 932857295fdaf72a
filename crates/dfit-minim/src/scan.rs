//! Third pass: per-parameter asymmetric-error scan.
//!
//! Each free parameter is probed individually on either side of the
//! optimum, holding every other parameter at its fitted value, until the
//! negative log-likelihood rises half a unit above the minimum. The
//! distance to that crossing, measured in external units, is the
//! one-sided error.

use dfit_core::DfitError;
use nalgebra::DVector;
use tracing::warn;

use crate::minimizer::FreeEval;
use crate::transform::BoundTransform;

/// NLL rise defining the one-sigma crossing.
const CROSSING_RISE: f64 = 0.5;
/// Doublings allowed while bracketing the crossing.
const MAX_EXPANSIONS: usize = 40;
/// Bisection refinements once bracketed.
const MAX_BISECTIONS: usize = 40;

/// One parameter's asymmetric errors, both as positive magnitudes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SideErrors {
    /// Error towards smaller values.
    pub neg: f64,
    /// Error towards larger values.
    pub pos: f64,
}

/// Scans every free parameter. `u_opt`/`f_min` describe the optimum from
/// the earlier passes; `steps` seed the bracketing walk.
pub(crate) fn scan_all(
    eval: &mut FreeEval<'_>,
    u_opt: &DVector<f64>,
    f_min: f64,
    steps: &DVector<f64>,
    transforms: &[BoundTransform],
) -> Result<Vec<SideErrors>, DfitError> {
    let target = f_min + CROSSING_RISE;
    let mut errors = Vec::with_capacity(u_opt.len());
    for k in 0..u_opt.len() {
        let neg = scan_side(eval, u_opt, target, steps[k], transforms[k], k, -1.0)?;
        let pos = scan_side(eval, u_opt, target, steps[k], transforms[k], k, 1.0)?;
        errors.push(SideErrors { neg, pos });
    }
    Ok(errors)
}

fn scan_side(
    eval: &mut FreeEval<'_>,
    u_opt: &DVector<f64>,
    target: f64,
    seed_step: f64,
    transform: BoundTransform,
    k: usize,
    sign: f64,
) -> Result<f64, DfitError> {
    let x_opt = transform.forward(u_opt[k]);

    // Bracket: double the displacement until the objective crosses the
    // target rise.
    let mut du = seed_step;
    let mut bracket = None;
    for _ in 0..MAX_EXPANSIONS {
        let mut probe = u_opt.clone();
        probe[k] += sign * du;
        let f = eval.eval(&probe)?;
        if f >= target {
            bracket = Some(du);
            break;
        }
        du *= 2.0;
    }
    let Some(mut hi) = bracket else {
        warn!(
            parameter = k,
            side = if sign < 0.0 { "neg" } else { "pos" },
            "asymmetric-error scan never crossed the target rise"
        );
        return Ok((transform.forward(u_opt[k] + sign * du) - x_opt).abs());
    };

    // Bisect between the optimum (below target) and the bracket.
    let mut lo = 0.0_f64;
    for _ in 0..MAX_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        let mut probe = u_opt.clone();
        probe[k] += sign * mid;
        let f = eval.eval(&probe)?;
        if f >= target {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let crossing = 0.5 * (lo + hi);
    Ok((transform.forward(u_opt[k] + sign * crossing) - x_opt).abs())
}
