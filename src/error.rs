//! Crate-wide error type.
//!
//! Shortages and outdates are simulation outcomes, not errors; they are
//! reported through [`crate::report::DayReport`]. Errors here are either
//! data problems caught at construction time or solver outcomes the run
//! cannot recover from.

use thiserror::Error;

/// Errors raised by the allocation engine.
#[derive(Error, Debug)]
pub enum MatchError {
    /// The solver proved the day's model infeasible. Shortage variables make
    /// every well-formed model feasible, so this indicates a formulation or
    /// configuration bug and ends the run.
    #[error("allocation model is infeasible: {0}")]
    InfeasibleModel(String),

    /// The solver stopped before certifying optimality and produced no
    /// incumbent to fall back on.
    #[error("solver hit its limit after {elapsed_ms} ms without a solution")]
    SolverTimeout { elapsed_ms: u64 },

    /// Malformed entity data (phenotype vector, quantity, day ordering).
    #[error("inconsistent data: {0}")]
    DataInconsistency(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The generated linear model references unknown variables or has
    /// mismatched rows.
    #[error("invalid model: {0}")]
    ModelInvalid(String),

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl MatchError {
    pub(crate) fn data(msg: impl Into<String>) -> Self {
        MatchError::DataInconsistency(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MatchError>;
