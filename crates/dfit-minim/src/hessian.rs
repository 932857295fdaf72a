//! Second pass: central-difference Hessian at the optimum and its
//! classification into a covariance matrix.

use dfit_core::{DfitError, FitQuality};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::warn;

use crate::minimizer::FreeEval;

/// Relative eigenvalue floor applied when forcing positive definiteness.
const EIGEN_FLOOR_RELATIVE: f64 = 1e-9;

/// Internal-coordinate covariance and its quality classification.
pub(crate) struct Curvature {
    /// Inverse Hessian (or its repaired substitute) in internal
    /// coordinates.
    pub covariance: DMatrix<f64>,
    /// Accuracy of the inversion.
    pub quality: FitQuality,
}

/// Builds the central-difference Hessian around `u` and inverts it.
///
/// A clean Cholesky inversion classifies as `Full`; an eigenvalue-clamped
/// repair as `ForcedPosDef`; a Hessian with non-finite entries falls back
/// to a diagonal covariance built from the probe steps (`Approximate`).
pub(crate) fn curvature(
    eval: &mut FreeEval<'_>,
    u: &DVector<f64>,
    steps: &DVector<f64>,
) -> Result<Curvature, DfitError> {
    let n = u.len();
    let f0 = eval.eval(u)?;
    let mut hessian = DMatrix::zeros(n, n);

    for i in 0..n {
        let h = steps[i];
        let mut plus = u.clone();
        plus[i] += h;
        let mut minus = u.clone();
        minus[i] -= h;
        let f_plus = eval.eval(&plus)?;
        let f_minus = eval.eval(&minus)?;
        hessian[(i, i)] = (f_plus - 2.0 * f0 + f_minus) / (h * h);
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let hi = steps[i];
            let hj = steps[j];
            let mut pp = u.clone();
            pp[i] += hi;
            pp[j] += hj;
            let mut pm = u.clone();
            pm[i] += hi;
            pm[j] -= hj;
            let mut mp = u.clone();
            mp[i] -= hi;
            mp[j] += hj;
            let mut mm = u.clone();
            mm[i] -= hi;
            mm[j] -= hj;
            let value = (eval.eval(&pp)? - eval.eval(&pm)? - eval.eval(&mp)?
                + eval.eval(&mm)?)
                / (4.0 * hi * hj);
            hessian[(i, j)] = value;
            hessian[(j, i)] = value;
        }
    }

    if hessian.iter().any(|x| !x.is_finite()) {
        warn!("hessian contains non-finite entries, falling back to diagonal covariance");
        let mut diagonal = DMatrix::zeros(n, n);
        for i in 0..n {
            diagonal[(i, i)] = steps[i] * steps[i];
        }
        return Ok(Curvature {
            covariance: diagonal,
            quality: FitQuality::Approximate,
        });
    }

    if let Some(cholesky) = hessian.clone().cholesky() {
        let inverse = cholesky.inverse();
        if inverse.iter().all(|x| x.is_finite()) {
            return Ok(Curvature {
                covariance: inverse,
                quality: FitQuality::Full,
            });
        }
    }

    warn!("hessian not positive definite, forcing via eigenvalue clamp");
    Ok(forced_positive_definite(hessian))
}

/// Eigen-decomposes the Hessian, clamps non-positive eigenvalues to a
/// small positive floor, and rebuilds the inverse.
fn forced_positive_definite(hessian: DMatrix<f64>) -> Curvature {
    let n = hessian.nrows();
    let eigen = SymmetricEigen::new(hessian);
    let max_abs = eigen
        .eigenvalues
        .iter()
        .map(|x| x.abs())
        .fold(0.0_f64, f64::max);
    let floor = (max_abs * EIGEN_FLOOR_RELATIVE).max(f64::MIN_POSITIVE.sqrt());
    let mut inv_eigenvalues = DVector::zeros(n);
    for i in 0..n {
        inv_eigenvalues[i] = 1.0 / eigen.eigenvalues[i].max(floor);
    }
    let vectors = eigen.eigenvectors;
    let covariance = &vectors * DMatrix::from_diagonal(&inv_eigenvalues) * vectors.transpose();
    Curvature {
        covariance,
        quality: FitQuality::ForcedPosDef,
    }
}
