//! Solver collaborator: the interface between a formulated
//! [`AllocationProgram`] and whatever searches it.
//!
//! Three reference implementations are bundled:
//!
//! - [`ExactSolver`]: depth-first branch and bound collecting a pool of
//!   equally-optimal selections, bounded by node count and wall time.
//! - [`AnnealingSolver`]: simulated annealing over complete plans, started
//!   from a greedy construction.
//! - [`AutoSolver`]: exact search, with the incumbent polished by annealing
//!   when the exact search hits its limits.
//!
//! An external MIP backend implements [`AllocationSolver`] by consuming
//! [`AllocationProgram::linear`] and mapping its `x` values back to a
//! [`Selection`].

mod anneal;
mod auto;
mod exact;

pub use anneal::{AnnealResult, Annealer, AnnealingSolver, AnnealProblem, CoolingSchedule};
pub use auto::AutoSolver;
pub use exact::ExactSolver;

use crate::model::{AllocationProgram, Selection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Status of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    /// Proven optimal; the pool holds equally-optimal selections.
    Optimal,
    /// Feasible but not proven optimal.
    Feasible,
    /// No feasible selection exists.
    Infeasible,
    /// The program is malformed.
    ModelInvalid,
    /// A limit was hit; the pool holds the best incumbent, if any.
    Timeout,
    /// No solution for another reason.
    Unknown,
}

impl SolverStatus {
    /// Whether the status is a configuration bug rather than a degraded
    /// solve.
    pub fn is_fatal(self) -> bool {
        matches!(self, SolverStatus::Infeasible | SolverStatus::ModelInvalid)
    }

    /// Whether a solve with this status is proven optimal.
    pub fn is_optimal(self) -> bool {
        self == SolverStatus::Optimal
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SolverStatus::Optimal => "optimal",
            SolverStatus::Feasible => "feasible",
            SolverStatus::Infeasible => "infeasible",
            SolverStatus::ModelInvalid => "model_invalid",
            SolverStatus::Timeout => "timeout",
            SolverStatus::Unknown => "unknown",
        })
    }
}

/// Result of one solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolverStatus,
    /// Distinct selections sharing the best objective found, best first.
    pub pool: Vec<Selection>,
    pub elapsed_ms: u64,
    /// Search nodes or annealing iterations spent.
    pub nodes: u64,
}

impl SolveOutcome {
    /// An outcome without solutions.
    pub fn empty(status: SolverStatus) -> Self {
        Self {
            status,
            pool: Vec::new(),
            elapsed_ms: 0,
            nodes: 0,
        }
    }

    /// Whether at least one selection was found.
    pub fn is_solution_found(&self) -> bool {
        !self.pool.is_empty()
    }
}

/// Searches an [`AllocationProgram`].
pub trait AllocationSolver: Send + Sync {
    fn name(&self) -> &str;

    fn solve(&self, program: &AllocationProgram, config: &SolverConfig) -> SolveOutcome;
}

/// Search limits and parameters shared by the bundled solvers.
///
/// # Examples
///
/// ```
/// use rbc_matching::solver::SolverConfig;
///
/// let config = SolverConfig::default()
///     .with_time_limit_ms(2_000)
///     .with_pool_size(10)
///     .with_seed(7);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Wall-clock budget per solve.
    pub time_limit_ms: u64,
    /// Branch-and-bound node budget per solve.
    pub node_limit: u64,
    /// Maximum number of equally-optimal selections kept for tie-breaking.
    pub pool_size: usize,
    /// Annealing iterations when the exact search gives up.
    pub anneal_iterations: usize,
    pub cooling: CoolingSchedule,
    pub seed: u64,
    /// External cancellation. Checked between search nodes.
    #[serde(skip)]
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            time_limit_ms: 10_000,
            node_limit: 2_000_000,
            pool_size: 50,
            anneal_iterations: 20_000,
            cooling: CoolingSchedule::default(),
            seed: 42,
            cancel: None,
        }
    }
}

impl SolverConfig {
    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn with_node_limit(mut self, nodes: u64) -> Self {
        self.node_limit = nodes;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_anneal_iterations(mut self, n: usize) -> Self {
        self.anneal_iterations = n;
        self
    }

    pub fn with_cooling(mut self, cooling: CoolingSchedule) -> Self {
        self.cooling = cooling;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.time_limit_ms == 0 {
            return Err("time_limit_ms must be positive".into());
        }
        if self.node_limit == 0 {
            return Err("node_limit must be positive".into());
        }
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".into());
        }
        self.cooling.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SolverConfig::default();
        assert_eq!(config.pool_size, 50);
        assert!(config.validate().is_ok());
        assert!(!config.is_cancelled());
    }

    #[test]
    fn test_validate_limits() {
        assert!(SolverConfig::default().with_pool_size(0).validate().is_err());
        assert!(SolverConfig::default().with_time_limit_ms(0).validate().is_err());
        assert!(SolverConfig::default()
            .with_cooling(CoolingSchedule::Geometric { alpha: 1.5 })
            .validate()
            .is_err());
    }

    #[test]
    fn test_cancel_flag_is_not_serialized() {
        let flag = Arc::new(AtomicBool::new(true));
        let config = SolverConfig::default().with_cancel(flag);
        assert!(config.is_cancelled());
        let json = serde_json::to_string(&config).unwrap();
        let back: SolverConfig = serde_json::from_str(&json).unwrap();
        assert!(back.cancel.is_none());
        assert_eq!(back.time_limit_ms, config.time_limit_ms);
    }

    #[test]
    fn test_fatal_statuses() {
        assert!(SolverStatus::Infeasible.is_fatal());
        assert!(SolverStatus::ModelInvalid.is_fatal());
        assert!(!SolverStatus::Timeout.is_fatal());
        assert_eq!(SolverStatus::Timeout.to_string(), "timeout");
    }
}
