//! The concrete three-pass gradient minimizer.

use dfit_core::{DfitError, ErrorInfo, FitParameter, FitQuality, FitStatus};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use crate::gradient;
use crate::hessian;
use crate::scan;
use crate::transform::BoundTransform;
use crate::{Minimizer, MinimizerConfig, Objective};

/// Relative error assigned to a parameter declared with a nonzero value
/// but no initial error. Zero-error parameters otherwise look already
/// converged to the minimizer.
pub const DEFAULT_RELATIVE_ERROR: f64 = 0.01;

/// Absolute probe step used when a parameter has neither an initial
/// error nor a nonzero value to scale against.
pub const DEFAULT_ABSOLUTE_STEP: f64 = 0.01;

/// Wraps the objective so the passes can probe in internal coordinates.
/// Each probe is one `set_parameters` + `eval` pair on the coordinator.
pub(crate) struct FreeEval<'a> {
    objective: &'a mut dyn Objective,
    transforms: &'a [BoundTransform],
    asymm_exempt: bool,
    calls: usize,
}

impl FreeEval<'_> {
    pub(crate) fn eval(&mut self, u: &DVector<f64>) -> Result<f64, DfitError> {
        let values: Vec<f64> = u
            .iter()
            .zip(self.transforms)
            .map(|(ui, t)| t.forward(*ui))
            .collect();
        self.objective.set_parameters(&values, self.asymm_exempt)?;
        self.calls += 1;
        self.objective.eval()
    }
}

/// Gradient-descent minimizer with a curvature pass and an optional
/// asymmetric-error scan. One instance serves one fit at a time; the
/// coordinator re-initialises it per experiment.
#[derive(Debug)]
pub struct GradientMinimizer {
    config: MinimizerConfig,
    params: Vec<FitParameter>,
    declared_fixed: Vec<bool>,
    covariance: DMatrix<f64>,
}

impl GradientMinimizer {
    /// Creates a minimizer with the given tunables.
    pub fn new(config: MinimizerConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            declared_fixed: Vec::new(),
            covariance: DMatrix::zeros(0, 0),
        }
    }

    fn free_indices(&self) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.fixed)
            .map(|(i, _)| i)
            .collect()
    }
}

impl Minimizer for GradientMinimizer {
    fn initialise(&mut self, params: &[FitParameter]) -> Result<(), DfitError> {
        self.params = params.to_vec();
        self.declared_fixed = params.iter().map(|p| p.fixed).collect();
        self.covariance = DMatrix::zeros(0, 0);
        for param in &mut self.params {
            if param.error == 0.0 {
                param.error = if param.value != 0.0 {
                    DEFAULT_RELATIVE_ERROR * param.value.abs()
                } else {
                    DEFAULT_ABSOLUTE_STEP
                };
                debug!(
                    name = %param.name,
                    error = param.error,
                    "assigned default initial error"
                );
            }
        }
        Ok(())
    }

    fn minimise(&mut self, objective: &mut dyn Objective) -> Result<FitStatus, DfitError> {
        let free = self.free_indices();
        if free.is_empty() {
            return Err(DfitError::Config(ErrorInfo::new(
                "no-free-parameters",
                "minimisation requested with every parameter fixed",
            )));
        }
        let n = free.len();

        let transforms: Vec<BoundTransform> = free
            .iter()
            .map(|&i| BoundTransform::for_bounds(self.params[i].min_bound, self.params[i].max_bound))
            .collect();
        let u0 = DVector::from_iterator(
            n,
            free.iter()
                .zip(&transforms)
                .map(|(&i, t)| t.inverse(self.params[i].value)),
        );
        // Probe steps in internal coordinates, scaled from the external
        // errors through the local Jacobian.
        let steps = DVector::from_iterator(
            n,
            free.iter().zip(u0.iter().zip(&transforms)).map(|(&i, (ui, t))| {
                let deriv = t.deriv(*ui).abs();
                if deriv > 1e-12 {
                    (self.params[i].error / deriv).max(1e-8)
                } else {
                    DEFAULT_ABSOLUTE_STEP
                }
            }),
        );

        let (outcome, curvature, calls) = {
            let mut eval = FreeEval {
                objective: &mut *objective,
                transforms: &transforms,
                asymm_exempt: false,
                calls: 0,
            };
            let outcome = gradient::descend(&mut eval, u0, &steps, &self.config)?;
            let curvature = hessian::curvature(&mut eval, &outcome.u, &steps)?;
            // Park the objective at the optimum; the curvature probes
            // left it elsewhere.
            eval.eval(&outcome.u)?;
            (outcome, curvature, eval.calls)
        };
        info!(
            nll = outcome.f,
            edm = outcome.edm,
            iterations = outcome.iterations,
            evaluations = calls,
            converged = outcome.converged,
            quality = curvature.quality.as_str(),
            "minimisation passes complete"
        );

        // Covariance back to external coordinates through the diagonal
        // Jacobian at the optimum.
        let jacobian: Vec<f64> = outcome
            .u
            .iter()
            .zip(&transforms)
            .map(|(ui, t)| t.deriv(*ui))
            .collect();
        let mut cov_ext = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                cov_ext[(i, j)] = jacobian[i] * jacobian[j] * curvature.covariance[(i, j)];
            }
        }
        let global_correlations = global_correlations(&cov_ext);

        for (slot, &i) in free.iter().enumerate() {
            let param = &mut self.params[i];
            param.value = transforms[slot].forward(outcome.u[slot]);
            param.error = cov_ext[(slot, slot)].max(0.0).sqrt();
            param.global_correlation = global_correlations[slot];
        }

        if self.config.asymm_errors {
            objective.set_asymm_error_mode(true)?;
            let sides = {
                let mut eval = FreeEval {
                    objective: &mut *objective,
                    transforms: &transforms,
                    asymm_exempt: true,
                    calls: 0,
                };
                let sides =
                    scan::scan_all(&mut eval, &outcome.u, outcome.f, &steps, &transforms)?;
                eval.eval(&outcome.u)?;
                sides
            };
            objective.set_asymm_error_mode(false)?;
            for (slot, &i) in free.iter().enumerate() {
                self.params[i].neg_error = sides[slot].neg;
                self.params[i].pos_error = sides[slot].pos;
            }
        }

        self.covariance = cov_ext.clone();
        Ok(FitStatus {
            quality: curvature.quality,
            nll: outcome.f,
            edm: outcome.edm,
            covariance: cov_ext,
        })
    }

    fn fix_second_stage(&mut self) {
        for param in &mut self.params {
            if param.second_stage {
                param.fixed = true;
            }
        }
    }

    fn release_second_stage(&mut self) {
        for (param, &declared) in self.params.iter_mut().zip(&self.declared_fixed) {
            if param.second_stage {
                param.fixed = declared;
            }
        }
    }

    fn update_parameters(&self, params: &mut [FitParameter]) {
        for out in params.iter_mut() {
            if let Some(fitted) = self.params.iter().find(|p| p.name == out.name) {
                out.value = fitted.value;
                out.error = fitted.error;
                out.neg_error = fitted.neg_error;
                out.pos_error = fitted.pos_error;
                out.global_correlation = fitted.global_correlation;
            }
        }
    }

    fn covariance_matrix(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    fn free_parameter_count(&self) -> usize {
        self.free_indices().len()
    }
}

/// Global correlation coefficient per free parameter:
/// `rho_k = sqrt(1 - 1 / (V_kk * (V^-1)_kk))`, zero when the covariance
/// cannot be inverted.
fn global_correlations(covariance: &DMatrix<f64>) -> Vec<f64> {
    let n = covariance.nrows();
    if n == 1 {
        return vec![0.0];
    }
    let Some(precision) = covariance.clone().cholesky().map(|c| c.inverse()) else {
        return vec![0.0; n];
    };
    (0..n)
        .map(|k| {
            let product = covariance[(k, k)] * precision[(k, k)];
            if product > 0.0 {
                (1.0 - 1.0 / product).max(0.0).sqrt()
            } else {
                0.0
            }
        })
        .collect()
}
