//! The daily allocation entry point: formulate, solve, break ties,
//! interpret.

use super::program::{
    AllocationProgram, Formulation, ObjectiveBreakdown, ProgramOptions, Selection, EPS,
};
use super::tiebreak::TieBreaker;
use crate::config::MatchingConfig;
use crate::error::Result;
use crate::inventory::{InventoryUnit, Request, RequestId, UnitId};
use crate::solver::{AllocationSolver, AutoSolver, SolverConfig, SolverStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// What one request received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request: RequestId,
    /// Fully served; a request is never partially served.
    pub served: bool,
    pub units: Vec<UnitId>,
    /// Age of each issued unit on the issuing day, aligned with `units`.
    pub issue_ages: Vec<u32>,
    /// Minor antigens mismatched by the issued units.
    pub mismatch_mask: u32,
    pub mismatch_penalty: f64,
    /// Counted as today's demand by the solve.
    pub today: bool,
}

/// Result of one allocation solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub status: SolverStatus,
    /// One entry per request, in input order.
    pub outcomes: Vec<RequestOutcome>,
    pub objective: ObjectiveBreakdown,
    /// Equally-optimal selections the tie-break chose from.
    pub pool_size: usize,
    pub elapsed_ms: u64,
}

impl Assignment {
    fn from_selection(
        program: &AllocationProgram,
        sel: &[bool],
        objective: ObjectiveBreakdown,
        status: SolverStatus,
    ) -> Self {
        let outcomes = program
            .requests
            .iter()
            .zip(program.plan(sel))
            .map(|(slot, chosen)| {
                let mask = chosen.iter().fold(0, |m, &p| m | program.pairs[p].mismatch);
                RequestOutcome {
                    request: slot.id,
                    served: !chosen.is_empty(),
                    units: chosen.iter().map(|&p| program.unit_id(program.pairs[p].unit)).collect(),
                    issue_ages: chosen.iter().map(|&p| program.pairs[p].issue_age).collect(),
                    mismatch_mask: mask,
                    mismatch_penalty: slot.mismatch_penalty(mask),
                    today: slot.today,
                }
            })
            .collect();
        Self {
            status,
            outcomes,
            objective,
            pool_size: 0,
            elapsed_ms: 0,
        }
    }

    /// Nothing issued, every request short.
    pub fn empty(program: &AllocationProgram, status: SolverStatus) -> Self {
        let sel = program.empty_selection();
        let objective = program.evaluate(&sel).unwrap_or_default();
        Self::from_selection(program, &sel, objective, status)
    }

    pub fn outcome(&self, id: RequestId) -> Option<&RequestOutcome> {
        self.outcomes.iter().find(|o| o.request == id)
    }

    /// Every unit allocated, including tentative allocations to future
    /// requests.
    pub fn allocated_units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.outcomes.iter().flat_map(|o| o.units.iter().copied())
    }

    /// Units that leave inventory today.
    pub fn issued_today(&self) -> Vec<UnitId> {
        self.outcomes
            .iter()
            .filter(|o| o.today)
            .flat_map(|o| o.units.iter().copied())
            .collect()
    }

    pub fn shortages(&self) -> impl Iterator<Item = &RequestOutcome> + '_ {
        self.outcomes.iter().filter(|o| !o.served)
    }

    pub fn is_solution_found(&self) -> bool {
        matches!(
            self.status,
            SolverStatus::Optimal | SolverStatus::Feasible | SolverStatus::Timeout
        ) && self.pool_size > 0
    }
}

/// Formulates and solves allocation problems for one run.
///
/// Holds the resolved formulation, the solver and the tie-break chain;
/// nothing here changes between days.
pub struct AllocationModel {
    formulation: Formulation,
    solver: Box<dyn AllocationSolver>,
    solver_config: SolverConfig,
    tiebreak: TieBreaker,
}

impl AllocationModel {
    /// Resolves `config` and uses [`AutoSolver`] with the default tie-break
    /// chain.
    pub fn new(config: &MatchingConfig) -> Result<Self> {
        Ok(Self {
            formulation: Formulation::from_config(config)?,
            solver: Box::new(AutoSolver),
            solver_config: config.solver.clone(),
            tiebreak: TieBreaker::default_policy(),
        })
    }

    pub fn with_solver<S: AllocationSolver + 'static>(mut self, solver: S) -> Self {
        self.solver = Box::new(solver);
        self
    }

    pub fn with_tiebreaker(mut self, tiebreak: TieBreaker) -> Self {
        self.tiebreak = tiebreak;
        self
    }

    pub fn formulation(&self) -> &Formulation {
        &self.formulation
    }

    pub fn solver_config(&self) -> &SolverConfig {
        &self.solver_config
    }

    pub fn build_program(
        &self,
        units: &[InventoryUnit],
        requests: &[Request],
        options: ProgramOptions,
    ) -> AllocationProgram {
        AllocationProgram::build(&self.formulation, units, requests, options)
    }

    /// Online solve for `day`.
    pub fn solve(&self, units: &[InventoryUnit], requests: &[Request], day: u32) -> Assignment {
        self.solve_with(units, requests, ProgramOptions::online(day))
    }

    /// One solve over the whole horizon, using unit arrival days.
    pub fn solve_offline(&self, units: &[InventoryUnit], requests: &[Request]) -> Assignment {
        self.solve_with(units, requests, ProgramOptions::offline())
    }

    /// Solves with explicit options. A fatal or empty solve yields
    /// [`Assignment::empty`] carrying the solver status.
    pub fn solve_with(
        &self,
        units: &[InventoryUnit],
        requests: &[Request],
        options: ProgramOptions,
    ) -> Assignment {
        let program = self.build_program(units, requests, options);
        let outcome = self.solver.solve(&program, &self.solver_config);
        let status = outcome.status;

        if status.is_fatal() || outcome.pool.is_empty() {
            warn!(solver = self.solver.name(), %status, "no allocation found");
            let mut empty = Assignment::empty(&program, status);
            empty.elapsed_ms = outcome.elapsed_ms;
            return empty;
        }
        if status != SolverStatus::Optimal {
            warn!(
                solver = self.solver.name(),
                %status,
                elapsed_ms = outcome.elapsed_ms,
                "accepting uncertified incumbent"
            );
        }

        let Some((pool, best)) = self.optimal_pool(&program, outcome.pool) else {
            warn!(solver = self.solver.name(), "solver pool holds no valid selection");
            return Assignment::empty(&program, SolverStatus::Unknown);
        };
        let pick = self.tiebreak.select(&pool, &program).unwrap_or(0);
        let objective = best[pick];
        let mut assignment = Assignment::from_selection(&program, &pool[pick], objective, status);
        assignment.pool_size = pool.len();
        assignment.elapsed_ms = outcome.elapsed_ms;
        debug!(
            requests = requests.len(),
            units = units.len(),
            pairs = program.pairs.len(),
            pool = pool.len(),
            shortage = objective.shortage,
            quality = objective.quality(),
            "allocation solved"
        );
        assignment
    }

    /// Valid selections sharing the best objective, with their evaluations.
    fn optimal_pool(
        &self,
        program: &AllocationProgram,
        pool: Vec<Selection>,
    ) -> Option<(Vec<Selection>, Vec<ObjectiveBreakdown>)> {
        let evaluated: Vec<(Selection, ObjectiveBreakdown)> = pool
            .into_iter()
            .filter_map(|sel| program.evaluate(&sel).map(|e| (sel, e)))
            .collect();
        let best = evaluated
            .iter()
            .map(|(_, e)| e.tiers())
            .min_by(|a, b| program.objective.compare(*a, *b, EPS))?;
        Some(
            evaluated
                .into_iter()
                .filter(|(_, e)| program.objective.compare(e.tiers(), best, EPS) == Ordering::Equal)
                .unzip(),
        )
    }
}

impl std::fmt::Debug for AllocationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationModel")
            .field("solver", &self.solver.name())
            .field("solver_config", &self.solver_config)
            .field("tiebreak", &self.tiebreak)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::{Antigen, BloodProfile, MajorGroup};
    use crate::inventory::PatientGroup;
    use crate::solver::{AnnealingSolver, ExactSolver, SolveOutcome};

    fn model() -> AllocationModel {
        AllocationModel::new(&MatchingConfig::default()).unwrap()
    }

    #[test]
    fn test_trivial_feasibility() {
        let units = vec![InventoryUnit::new(UnitId(0), BloodProfile::all_negative(), 0)];
        let requests = vec![Request::new(
            RequestId(0),
            BloodProfile::with_group(MajorGroup::AbPos, &[Antigen::K, Antigen::Fya]),
            1,
            0,
            0,
            PatientGroup::Other,
        )
        .unwrap()];
        let a = model().solve(&units, &requests, 0);
        assert_eq!(a.status, SolverStatus::Optimal);
        assert!(a.outcomes[0].served);
        assert_eq!(a.outcomes[0].units, vec![UnitId(0)]);
        assert_eq!(a.objective.shortage, 0.0);
        assert_eq!(a.objective.mismatch, 0.0);
        assert_eq!(a.issued_today(), vec![UnitId(0)]);
    }

    #[test]
    fn test_forced_shortage() {
        let requests = vec![Request::new(
            RequestId(0),
            BloodProfile::all_negative(),
            2,
            0,
            0,
            PatientGroup::Other,
        )
        .unwrap()];
        let a = model().solve(&[], &requests, 0);
        assert_eq!(a.shortages().count(), 1);
        assert!(a.issued_today().is_empty());
        assert_eq!(a.objective.shortage, 2.0);
    }

    #[test]
    fn test_future_allocation_is_tentative() {
        let units = vec![InventoryUnit::new(UnitId(0), BloodProfile::all_negative(), 0)];
        let requests = vec![Request::new(
            RequestId(0),
            BloodProfile::all_negative(),
            1,
            0,
            3,
            PatientGroup::Other,
        )
        .unwrap()];
        let a = model().solve(&units, &requests, 0);
        assert!(a.outcomes[0].served);
        assert!(!a.outcomes[0].today);
        assert!(a.issued_today().is_empty());
        assert_eq!(a.allocated_units().count(), 1);
        assert_eq!(a.outcomes[0].issue_ages, vec![3]);
    }

    #[test]
    fn test_solvers_agree_on_small_instance() {
        let p = BloodProfile::all_negative();
        let units: Vec<_> = (0..5)
            .map(|i| InventoryUnit::new(UnitId(i), p, 5 * i as u32))
            .collect();
        let requests = vec![
            Request::new(RequestId(0), p, 2, 0, 0, PatientGroup::Other).unwrap(),
            Request::new(RequestId(1), p, 1, 0, 0, PatientGroup::Other).unwrap(),
        ];
        let exact = model().with_solver(ExactSolver).solve(&units, &requests, 0);
        let anneal = model()
            .with_solver(AnnealingSolver)
            .solve(&units, &requests, 0);
        assert_eq!(exact.objective.shortage, anneal.objective.shortage);
        let oldest: Vec<UnitId> = exact.issued_today();
        assert!(oldest.contains(&UnitId(4)));
        assert!(!oldest.contains(&UnitId(0)));
    }

    struct Refusing;

    impl AllocationSolver for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn solve(&self, _: &AllocationProgram, _: &SolverConfig) -> SolveOutcome {
            SolveOutcome::empty(SolverStatus::Infeasible)
        }
    }

    #[test]
    fn test_fatal_status_yields_empty_assignment() {
        let units = vec![InventoryUnit::new(UnitId(0), BloodProfile::all_negative(), 0)];
        let requests = vec![Request::new(
            RequestId(0),
            BloodProfile::all_negative(),
            1,
            0,
            0,
            PatientGroup::Other,
        )
        .unwrap()];
        let a = model().with_solver(Refusing).solve(&units, &requests, 0);
        assert_eq!(a.status, SolverStatus::Infeasible);
        assert!(!a.outcomes[0].served);
        assert!(!a.is_solution_found());
    }

    #[test]
    fn test_offline_solve_gates_on_arrival_day() {
        let unit = InventoryUnit::new(UnitId(0), BloodProfile::all_negative(), 0).with_arrival_day(5);
        let request = |id, issuing| {
            Request::new(RequestId(id), BloodProfile::all_negative(), 1, 0, issuing, PatientGroup::Other)
                .unwrap()
        };

        let early = model().solve_offline(std::slice::from_ref(&unit), &[request(0, 2)]);
        assert_eq!(early.status, SolverStatus::Optimal);
        assert!(!early.outcomes[0].served);

        let both = model().solve_offline(&[unit], &[request(0, 2), request(1, 6)]);
        assert_eq!(both.status, SolverStatus::Optimal);
        assert!(!both.outcome(RequestId(0)).unwrap().served);
        assert_eq!(both.outcome(RequestId(1)).unwrap().units, vec![UnitId(0)]);
        assert!(both.outcomes.iter().all(|o| o.today));
        // Every offline shortage weighs 1, whatever the issuing day.
        assert_eq!(both.objective.shortage, 1.0);
        assert_eq!(both.issued_today(), vec![UnitId(0)]);
    }
}
