#![deny(missing_docs)]
//! Core data types for the dfit distributed likelihood coordinator:
//! fit parameters, Gaussian constraints, fit status and the shared
//! structured error surface.

pub mod constraint;
pub mod errors;
pub mod formula;
mod params;
mod status;

pub use constraint::{ConstraintRegistry, ConstraintSpec, PenaltyTerm};
pub use errors::{DfitError, ErrorInfo};
pub use formula::FormulaExpr;
pub use params::{FitParameter, GaussConstraintMeta, ParamMismatch};
pub use status::{FitQuality, FitStatus};
