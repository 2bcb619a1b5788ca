//! Allocation formulation.
//!
//! - [`AllocationProgram`]: the typed problem for one solve, one issue
//!   variable per feasible unit/request pair.
//! - [`LinearModel`]: the same problem as a named binary linear program,
//!   for external solvers and verification.
//! - [`TieBreaker`]: ordered secondary criteria over equally-optimal plans.
//! - [`AllocationModel`]: formulate, solve, tie-break, interpret.

mod allocation;
mod linear;
mod program;
mod tiebreak;

pub use allocation::{AllocationModel, Assignment, RequestOutcome};
pub use linear::{BinaryVar, Constraint, LinearModel, Objective, Sense, VarId};
pub use program::{
    AllocationProgram, Formulation, Horizon, IssuePair, ObjectiveBreakdown, PairCost,
    ProgramOptions, RequestSlot, Selection, EPS,
};
pub use tiebreak::{
    FewestTodayMismatches, LowestTodaySubstitution, LowestTodayUsability, OldestIssued,
    TieBreakRule, TieBreaker,
};
