//! Exact search with an annealing fallback.

use super::{AllocationSolver, AnnealingSolver, ExactSolver, SolveOutcome, SolverConfig, SolverStatus};
use crate::model::{AllocationProgram, EPS};
use std::cmp::Ordering;
use tracing::debug;

/// Runs [`ExactSolver`]; when it stops on a limit, anneals from its
/// incumbent and keeps whichever plan is better.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoSolver;

impl AllocationSolver for AutoSolver {
    fn name(&self) -> &str {
        "auto"
    }

    fn solve(&self, program: &AllocationProgram, config: &SolverConfig) -> SolveOutcome {
        let exact = ExactSolver.solve(program, config);
        if exact.status != SolverStatus::Timeout || config.is_cancelled() {
            return exact;
        }
        let Some(start) = exact.pool.first().cloned() else {
            return exact;
        };

        let polished = AnnealingSolver.polish(program, config, start);
        let cost = |sel: &[bool]| program.evaluate(sel).map(|e| e.tiers());
        let better = match (polished.pool.first().and_then(|s| cost(s)), cost(&exact.pool[0])) {
            (Some(a), Some(b)) => program.objective.compare(a, b, EPS) == Ordering::Less,
            (Some(_), None) => true,
            _ => false,
        };
        debug!(better, "annealing polish after exact timeout");

        let mut out = if better { polished } else { exact.clone() };
        out.status = SolverStatus::Timeout;
        out.elapsed_ms = exact.elapsed_ms + if better { out.elapsed_ms } else { 0 };
        out.nodes = exact.nodes;
        out
    }
}
