use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Accuracy classification of the covariance matrix produced by the
/// minimizer's curvature pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FitQuality {
    /// No covariance information computed.
    NotCalculated,
    /// Diagonal-only or otherwise crude approximation.
    Approximate,
    /// Covariance repaired by forcing positive definiteness.
    ForcedPosDef,
    /// Full accurate covariance. The only value counted as a successful
    /// fit by the coordinator's OK/Bad bookkeeping.
    Full,
}

impl FitQuality {
    /// Whether this quality counts as a successful fit.
    pub fn is_full(self) -> bool {
        matches!(self, FitQuality::Full)
    }

    /// Short label used in logs and the results table.
    pub fn as_str(self) -> &'static str {
        match self {
            FitQuality::NotCalculated => "not-calculated",
            FitQuality::Approximate => "approximate",
            FitQuality::ForcedPosDef => "forced-pos-def",
            FitQuality::Full => "full",
        }
    }
}

/// Outcome of one minimisation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FitStatus {
    /// Covariance accuracy classification.
    pub quality: FitQuality,
    /// Negative log-likelihood at the minimum.
    pub nll: f64,
    /// Estimated distance to minimum reported by the gradient pass.
    pub edm: f64,
    /// Covariance over the free parameters, in free-slot order.
    pub covariance: DMatrix<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_full_counts_as_success() {
        assert!(FitQuality::Full.is_full());
        assert!(!FitQuality::ForcedPosDef.is_full());
        assert!(!FitQuality::Approximate.is_full());
        assert!(!FitQuality::NotCalculated.is_full());
    }

    #[test]
    fn quality_orders_by_accuracy() {
        assert!(FitQuality::NotCalculated < FitQuality::Approximate);
        assert!(FitQuality::ForcedPosDef < FitQuality::Full);
    }
}
