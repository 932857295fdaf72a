#![deny(missing_docs)]
//! The dfit coordinator: owns the worker sessions, the canonical global
//! parameter registry, the minimizer and the fit bookkeeping, and drives
//! the per-experiment broadcast/collect protocol that turns independent
//! remote partial likelihoods into one synchronous objective function.

pub mod coordinator;
pub mod reconcile;
pub mod results;
pub mod session;
pub mod state;

pub use coordinator::{Coordinator, LoadOutcome, RunConfig, RunSummary};
pub use reconcile::ParamIndexMap;
pub use session::WorkerPool;
pub use state::FitState;
