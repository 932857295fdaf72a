//! Bound-respecting coordinate transforms.
//!
//! The descent and curvature passes work in unconstrained internal
//! coordinates; each free parameter carries one transform mapping its
//! internal coordinate to the bounded external value, so the passes never
//! have to clip or reject probes.

/// Mapping between an internal (unbounded) coordinate and the external
/// (possibly bounded) parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundTransform {
    /// `x = u`
    Identity,
    /// `x = lo + (hi - lo) * sigmoid(u)`
    Finite {
        /// Lower bound.
        lo: f64,
        /// Upper bound.
        hi: f64,
    },
    /// `x = lo + exp(u)`
    Lower {
        /// Lower bound.
        lo: f64,
    },
    /// `x = hi - exp(u)`
    Upper {
        /// Upper bound.
        hi: f64,
    },
}

impl BoundTransform {
    /// Chooses the transform matching the parameter's bound pattern.
    pub fn for_bounds(lo: f64, hi: f64) -> Self {
        match (lo.is_finite(), hi.is_finite()) {
            (true, true) => BoundTransform::Finite { lo, hi },
            (true, false) => BoundTransform::Lower { lo },
            (false, true) => BoundTransform::Upper { hi },
            (false, false) => BoundTransform::Identity,
        }
    }

    /// Internal → external.
    pub fn forward(self, u: f64) -> f64 {
        match self {
            BoundTransform::Identity => u,
            BoundTransform::Finite { lo, hi } => lo + (hi - lo) * sigmoid(u),
            BoundTransform::Lower { lo } => lo + u.exp(),
            BoundTransform::Upper { hi } => hi - u.exp(),
        }
    }

    /// External → internal. Values outside the bounds are clamped just
    /// inside before inversion.
    pub fn inverse(self, x: f64) -> f64 {
        const EPS: f64 = 1e-12;
        match self {
            BoundTransform::Identity => x,
            BoundTransform::Finite { lo, hi } => {
                let denom = (hi - lo).max(EPS);
                let t = ((x - lo) / denom).clamp(EPS, 1.0 - EPS);
                (t / (1.0 - t)).ln()
            }
            BoundTransform::Lower { lo } => (x - lo).max(EPS).ln(),
            BoundTransform::Upper { hi } => (hi - x).max(EPS).ln(),
        }
    }

    /// `dx/du` at the given internal coordinate (diagonal Jacobian).
    pub fn deriv(self, u: f64) -> f64 {
        match self {
            BoundTransform::Identity => 1.0,
            BoundTransform::Finite { lo, hi } => {
                let s = sigmoid(u);
                (hi - lo) * s * (1.0 - s)
            }
            BoundTransform::Lower { .. } => u.exp(),
            BoundTransform::Upper { .. } => -u.exp(),
        }
    }
}

/// Numerically stable sigmoid.
fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_inverse_round_trip() {
        let cases = [
            (BoundTransform::Identity, 2.5),
            (BoundTransform::for_bounds(0.0, 10.0), 3.7),
            (BoundTransform::for_bounds(1.0, f64::INFINITY), 4.2),
            (BoundTransform::for_bounds(f64::NEG_INFINITY, 5.0), -1.0),
        ];
        for (transform, x) in cases {
            let u = transform.inverse(x);
            assert!((transform.forward(u) - x).abs() < 1e-9, "{transform:?}");
        }
    }

    #[test]
    fn finite_transform_respects_bounds() {
        let transform = BoundTransform::for_bounds(-1.0, 1.0);
        for u in [-50.0, -5.0, 0.0, 5.0, 50.0] {
            let x = transform.forward(u);
            assert!(x > -1.0 && x < 1.0);
        }
    }

    #[test]
    fn deriv_matches_finite_difference() {
        let transform = BoundTransform::for_bounds(0.0, 4.0);
        let u = 0.3;
        let h = 1e-6;
        let numeric = (transform.forward(u + h) - transform.forward(u - h)) / (2.0 * h);
        assert!((transform.deriv(u) - numeric).abs() < 1e-6);
    }

    #[test]
    fn unbounded_pattern_selects_identity() {
        assert_eq!(
            BoundTransform::for_bounds(f64::NEG_INFINITY, f64::INFINITY),
            BoundTransform::Identity
        );
    }
}
