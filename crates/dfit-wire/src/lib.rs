#![deny(missing_docs)]
//! Protocol messages exchanged between the dfit coordinator and its
//! workers, plus the framed codec that carries them.
//!
//! The protocol is deliberately small: the coordinator only ever issues
//! the eight requests below, and every reply that feeds a fan-in carries
//! an explicit `worker_id` so attribution never depends on arrival order.

use serde::{Deserialize, Serialize};

use dfit_core::{FitParameter, FitQuality};

mod frame;

pub use frame::{read_frame, write_frame, MAX_FRAME_BYTES};

/// Requests sent coordinator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordRequest {
    /// Ask the worker for its ordered parameter declarations.
    DeclareParameters,
    /// Activate the given experiment's data on the worker.
    LoadExperiment {
        /// Experiment identifier to activate.
        expt_id: u32,
    },
    /// Ask the worker to build whatever per-experiment caches it needs
    /// before evaluation rounds begin.
    Cache,
    /// One objective-evaluation round: the worker computes its partial
    /// negative log-likelihood at the supplied parameter values.
    Evaluate {
        /// Global parameter count (diagnostic cross-check).
        n_total: u32,
        /// Free global parameter count for this round.
        n_free: u32,
        /// Values for this worker's parameters, in the worker's declared
        /// order. Only the worker's own footprint is sent.
        values: Vec<f64>,
    },
    /// Tell the worker whether an asymmetric-error scan is in progress.
    SetAsymmErrorMode {
        /// True while the scan runs.
        enabled: bool,
    },
    /// Hand the worker its slice of the fit outcome for local bookkeeping.
    Finalize {
        /// Covariance accuracy classification of the fit.
        quality: FitQuality,
        /// Total negative log-likelihood at the minimum.
        nll: f64,
        /// Estimated distance to minimum.
        edm: f64,
        /// This worker's parameters with final values and errors filled in.
        parameters: Vec<FitParameter>,
        /// Covariance sub-block over this worker's free parameters, row
        /// major, sized `free × free` in the worker's free-slot order.
        covariance: Vec<Vec<f64>>,
    },
    /// Flush worker-side output. One-shot, end of run.
    Persist,
    /// Fire-and-forget: the coordinator closes the connection after
    /// sending this and expects no reply.
    Shutdown,
}

/// Replies sent worker → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    /// Ordered parameter declarations for this worker.
    Parameters {
        /// Replying worker.
        worker_id: u32,
        /// Declarations in the worker's own stable order.
        params: Vec<FitParameter>,
    },
    /// Experiment loaded.
    Loaded {
        /// Replying worker.
        worker_id: u32,
        /// Number of events in the activated experiment; zero makes the
        /// coordinator skip the experiment.
        event_count: u64,
    },
    /// Cache pass finished.
    Cached {
        /// Replying worker.
        worker_id: u32,
        /// Whether cache preparation succeeded.
        ok: bool,
    },
    /// One partial likelihood evaluation.
    Evaluated {
        /// Replying worker.
        worker_id: u32,
        /// Partial negative log-likelihood. Exactly zero, NaN and
        /// non-finite values flag the round degenerate on the
        /// coordinator side.
        partial_nll: f64,
    },
    /// Asymmetric-error mode acknowledged.
    AsymmErrorMode {
        /// Replying worker.
        worker_id: u32,
        /// Acknowledgement flag.
        ack: bool,
    },
    /// Finalize handshake reply.
    Finalized {
        /// Replying worker.
        worker_id: u32,
        /// Whether worker-side finalisation succeeded.
        ok: bool,
        /// The worker's (possibly adjusted) finalized parameter values,
        /// merged back into the global list by name.
        parameters: Vec<FitParameter>,
    },
    /// Worker-side output flushed.
    Persisted {
        /// Replying worker.
        worker_id: u32,
        /// Whether the flush succeeded.
        ok: bool,
    },
}

impl WorkerReply {
    /// The explicit worker id carried by the reply. Fan-in attribution
    /// uses this field, never arrival order.
    pub fn worker_id(&self) -> u32 {
        match self {
            WorkerReply::Parameters { worker_id, .. }
            | WorkerReply::Loaded { worker_id, .. }
            | WorkerReply::Cached { worker_id, .. }
            | WorkerReply::Evaluated { worker_id, .. }
            | WorkerReply::AsymmErrorMode { worker_id, .. }
            | WorkerReply::Finalized { worker_id, .. }
            | WorkerReply::Persisted { worker_id, .. } => *worker_id,
        }
    }
}
