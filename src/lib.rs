#![warn(missing_docs)]
#![doc(test(no_crate_inject))]

//! This crate turns raw census microdata into differentially private
//! synthetic microdata using the "TopDown" approach, as described by these
//! papers:
//!
//! - Abowd et al., [The 2020 Census Disclosure Avoidance System TopDown
//!   Algorithm][tda], 2022
//! - Canonne, Kamath, Steinke, [The Discrete Gaussian for Differential
//!   Privacy][cks20], 2020
//!
//! [tda]: https://arxiv.org/abs/2204.08986
//! [cks20]: https://arxiv.org/abs/2004.00010
//!
//! Raw records are aggregated into per-node contingency vectors along a
//! geographic hierarchy, exact integer noise is added to every node under a
//! per-level privacy budget, and a two-stage constrained optimization pass
//! restores non-negativity, integrality and parent-child consistency before
//! synthetic records are written out. Intermediate state is checkpointed
//! after every phase so a run can later be extended to deeper geographic
//! levels without redoing the upper ones.

pub mod basis;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod engine;
pub mod estimate;
pub mod measure;
pub mod microdata;
pub mod noise;
pub mod quality;
pub mod solver;
pub mod tree;

pub use basis::Basis;
pub use config::{ConstraintSpec, DistanceMetric, Mechanism, RunConfig};
pub use data::Dataset;
pub use engine::TopDown;
pub use solver::{Constraint, ProjectionSolver, Sense, Solver};
pub use tree::GeoTree;

/// Errors surfaced by the engine.
///
/// Recoverable solver failures are retried internally; everything else
/// reaches the caller with a message naming the offending node path and
/// phase where one applies.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TopDownError {
    /// Missing or conflicting configuration, e.g. an unknown attribute name.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or missing fields in the raw records.
    #[error("input error: {0}")]
    Input(String),

    /// A non-positive privacy budget or variance, or an unknown level.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// User constraints are inconsistent with the parent sums. Fatal; the
    /// run is aborted after flushing a checkpoint for inspection.
    #[error("infeasible constraints at node [{path}] during {phase}: {detail}")]
    Infeasible {
        /// Geographic path of the node group whose problem was infeasible.
        path: String,
        /// Phase in which the failure occurred.
        phase: String,
        /// Solver-reported detail.
        detail: String,
    },

    /// The solver failed for a reason other than infeasibility, repeatedly
    /// enough to exhaust the retry budget.
    #[error("solver failure at node [{path}] during {phase}: {detail}")]
    Solver {
        /// Geographic path of the node group being solved.
        path: String,
        /// Phase in which the failure occurred.
        phase: String,
        /// Solver-reported detail.
        detail: String,
    },

    /// A checkpoint is missing, corrupt, or incompatible with the current
    /// configuration.
    #[error("state error: {0}")]
    State(String),

    /// The run was cancelled cooperatively; a checkpoint has been written.
    #[error("interrupted during {0}; checkpoint written")]
    Interrupted(String),

    /// An underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TopDownError>;
