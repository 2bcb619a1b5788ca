//! Simulated annealing over complete allocation plans.
//!
//! [`Annealer`] drives an [`AnnealProblem`] whose costs need not be plain
//! numbers: the problem decides which moves improve and how far uphill the
//! rest go. For allocation plans the cost is the `(shortage, quality)`
//! pair. Under a lexicographic objective a move that loses coverage is
//! never taken, and Metropolis acceptance only weighs quality against a
//! temperature scaled to the program's own pair costs.
//!
//! The allocation neighbourhood keeps every plan valid with respect to
//! single use and exact quantities. Penalty-cap violations evaluate to an
//! infinite shortage and are rejected.
//!
//! # References
//!
//! - Kirkpatrick, Gelatt & Vecchi (1983), "Optimization by Simulated Annealing"
//! - Lundy & Mees (1986), "Convergence of an Annealing Algorithm"

use super::exact::greedy;
use super::{AllocationSolver, SolveOutcome, SolverConfig, SolverStatus};
use crate::config::ObjectiveMode;
use crate::model::{AllocationProgram, Selection, EPS};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Cooling schedule for temperature reduction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoolingSchedule {
    /// `T_{k+1} = alpha * T_k`.
    Geometric { alpha: f64 },
    /// `T_k = T_0 - k * (T_0 - T_min) / steps`.
    Linear,
    /// `T_{k+1} = T_k / (1 + beta * T_k)`, one iteration per step.
    LundyMees { beta: f64 },
}

impl Default for CoolingSchedule {
    fn default() -> Self {
        CoolingSchedule::Geometric { alpha: 0.95 }
    }
}

impl CoolingSchedule {
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            CoolingSchedule::Geometric { alpha } if alpha <= 0.0 || alpha >= 1.0 => {
                Err(format!("geometric alpha must be in (0, 1), got {alpha}"))
            }
            CoolingSchedule::LundyMees { beta } if beta <= 0.0 => {
                Err(format!("lundy-mees beta must be positive, got {beta}"))
            }
            _ => Ok(()),
        }
    }
}

/// A problem searched by [`Annealer`].
pub trait AnnealProblem {
    type Solution: Clone;
    type Cost: Copy;

    fn initial_solution<R: Rng>(&self, rng: &mut R) -> Self::Solution;

    fn cost(&self, solution: &Self::Solution) -> Self::Cost;

    fn neighbor<R: Rng>(&self, solution: &Self::Solution, rng: &mut R) -> Self::Solution;

    /// Whether `candidate` is strictly better than `incumbent`.
    fn improves(&self, candidate: Self::Cost, incumbent: Self::Cost) -> bool;

    /// Size of a non-improving move, weighed against the temperature.
    /// `None` rejects the move whatever the temperature.
    fn uphill(&self, from: Self::Cost, to: Self::Cost) -> Option<f64>;
}

/// Result of an annealing run.
#[derive(Debug, Clone)]
pub struct AnnealResult<S: Clone, C: Copy> {
    pub best: S,
    pub best_cost: C,
    pub iterations: usize,
    pub final_temperature: f64,
    pub accepted_moves: usize,
    pub improving_moves: usize,
    pub cancelled: bool,
    /// Best cost sampled every [`Annealer::iterations_per_temperature`]
    /// iterations.
    pub cost_history: Vec<C>,
}

/// Annealing loop parameters.
///
/// # Examples
///
/// ```
/// use rbc_matching::solver::{Annealer, CoolingSchedule};
///
/// let annealer = Annealer::new(7)
///     .with_temperatures(10.0, 0.01)
///     .with_cooling(CoolingSchedule::Geometric { alpha: 0.9 })
///     .with_max_iterations(5_000);
/// assert!(annealer.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Annealer {
    pub initial_temperature: f64,
    pub min_temperature: f64,
    pub cooling: CoolingSchedule,
    /// Ignored for Lundy–Mees, which runs one iteration per step.
    pub iterations_per_temperature: usize,
    /// Hard budget; 0 means no limit.
    pub max_iterations: usize,
    pub seed: u64,
}

impl Annealer {
    pub fn new(seed: u64) -> Self {
        Self {
            initial_temperature: 1.0,
            min_temperature: 1e-4,
            cooling: CoolingSchedule::default(),
            iterations_per_temperature: 100,
            max_iterations: 0,
            seed,
        }
    }

    /// Parameters for polishing an allocation under `config`.
    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(config.seed)
            .with_cooling(config.cooling)
            .with_max_iterations(config.anneal_iterations)
    }

    pub fn with_temperatures(mut self, initial: f64, min: f64) -> Self {
        self.initial_temperature = initial;
        self.min_temperature = min;
        self
    }

    pub fn with_cooling(mut self, cooling: CoolingSchedule) -> Self {
        self.cooling = cooling;
        self
    }

    pub fn with_iterations_per_temperature(mut self, n: usize) -> Self {
        self.iterations_per_temperature = n;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_temperature <= 0.0 {
            return Err("initial_temperature must be positive".into());
        }
        if self.min_temperature <= 0.0 {
            return Err("min_temperature must be positive".into());
        }
        if self.min_temperature >= self.initial_temperature {
            return Err("min_temperature must be less than initial_temperature".into());
        }
        self.cooling.validate()
    }

    /// Runs the loop until the temperature floor, the iteration budget or
    /// cancellation.
    pub fn run<P: AnnealProblem>(
        &self,
        problem: &P,
        cancel: Option<&AtomicBool>,
    ) -> Result<AnnealResult<P::Solution, P::Cost>, String> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut current = problem.initial_solution(&mut rng);
        let mut current_cost = problem.cost(&current);
        let mut result = AnnealResult {
            best: current.clone(),
            best_cost: current_cost,
            iterations: 0,
            final_temperature: self.initial_temperature,
            accepted_moves: 0,
            improving_moves: 0,
            cancelled: false,
            cost_history: vec![current_cost],
        };
        let sample_every = self.iterations_per_temperature.max(1);
        let steps_per_level = match self.cooling {
            CoolingSchedule::LundyMees { .. } => 1,
            _ => self.iterations_per_temperature,
        };
        let mut temperature = self.initial_temperature;
        let mut level = 0usize;

        'levels: while temperature > self.min_temperature {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                result.cancelled = true;
                break;
            }
            for _ in 0..steps_per_level {
                if self.exhausted(result.iterations) {
                    break 'levels;
                }
                result.iterations += 1;

                let candidate = problem.neighbor(&current, &mut rng);
                let candidate_cost = problem.cost(&candidate);
                let taken = if problem.improves(candidate_cost, current_cost) {
                    result.improving_moves += 1;
                    true
                } else {
                    problem
                        .uphill(current_cost, candidate_cost)
                        .is_some_and(|rise| rng.random::<f64>() < (-rise / temperature).exp())
                };
                if taken {
                    result.accepted_moves += 1;
                    current = candidate;
                    current_cost = candidate_cost;
                    if problem.improves(current_cost, result.best_cost) {
                        result.best = current.clone();
                        result.best_cost = current_cost;
                    }
                }
                if result.iterations.is_multiple_of(sample_every) {
                    result.cost_history.push(result.best_cost);
                }
            }
            level += 1;
            temperature = self.cool(temperature, level);
        }

        if !result.iterations.is_multiple_of(sample_every) {
            result.cost_history.push(result.best_cost);
        }
        result.final_temperature = temperature;
        Ok(result)
    }

    fn exhausted(&self, iterations: usize) -> bool {
        self.max_iterations > 0 && iterations >= self.max_iterations
    }

    /// Temperature after `level` completed levels.
    fn cool(&self, temperature: f64, level: usize) -> f64 {
        match self.cooling {
            CoolingSchedule::Geometric { alpha } => temperature * alpha,
            CoolingSchedule::Linear => {
                // Spread the descent over the iteration budget, or 1000 levels.
                let levels = match (self.max_iterations, self.iterations_per_temperature) {
                    (0, _) | (_, 0) => 1000,
                    (max, per) => (max / per).max(1),
                };
                let drop = (self.initial_temperature - self.min_temperature) / levels as f64;
                (self.initial_temperature - level as f64 * drop).max(self.min_temperature)
            }
            CoolingSchedule::LundyMees { beta } => temperature / (1.0 + beta * temperature),
        }
    }
}

/// A complete plan: the selection plus the lookups moves need.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    sel: Selection,
    /// Pair currently holding each unit.
    owner: Vec<Option<usize>>,
    /// Chosen pairs per request.
    served: Vec<Vec<usize>>,
}

impl Plan {
    fn from_selection(program: &AllocationProgram, sel: Selection) -> Self {
        let mut owner = vec![None; program.unit_count()];
        for (p, pair) in program.pairs.iter().enumerate() {
            if sel[p] {
                owner[pair.unit] = Some(p);
            }
        }
        let served = program.plan(&sel);
        Self { sel, owner, served }
    }

    fn release(&mut self, program: &AllocationProgram, p: usize) {
        self.sel[p] = false;
        self.owner[program.pairs[p].unit] = None;
    }

    fn assign(&mut self, program: &AllocationProgram, p: usize) {
        self.sel[p] = true;
        self.owner[program.pairs[p].unit] = Some(p);
    }
}

/// The allocation neighbourhood.
struct PlanSearch<'a> {
    program: &'a AllocationProgram,
    start: Selection,
    /// `(unit, request)` to pair index.
    pair_of: HashMap<(usize, usize), usize>,
}

impl<'a> PlanSearch<'a> {
    fn new(program: &'a AllocationProgram, start: Selection) -> Self {
        let pair_of = program
            .pairs
            .iter()
            .enumerate()
            .map(|(p, pair)| ((pair.unit, pair.request), p))
            .collect();
        Self {
            program,
            start,
            pair_of,
        }
    }

    /// Largest quality cost a single pair adds, the natural unit for the
    /// starting temperature.
    fn quality_scale(&self) -> f64 {
        let widest = self
            .program
            .pairs
            .iter()
            .map(|pair| {
                let slot = &self.program.requests[pair.request];
                (pair.cost.total() + slot.mismatch_penalty(pair.mismatch)).abs()
            })
            .fold(0.0, f64::max);
        if widest > EPS {
            widest
        } else {
            1.0
        }
    }

    fn free_candidates(&self, plan: &Plan, r: usize) -> Vec<usize> {
        self.program.requests[r]
            .pairs
            .iter()
            .copied()
            .filter(|&p| plan.owner[self.program.pairs[p].unit].is_none())
            .collect()
    }

    fn serve<R: Rng>(&self, plan: &mut Plan, r: usize, rng: &mut R) {
        let n = self.program.requests[r].num_units as usize;
        let mut cands = self.free_candidates(plan, r);
        if cands.len() < n {
            return;
        }
        cands.shuffle(rng);
        cands.truncate(n);
        for &p in &cands {
            plan.assign(self.program, p);
        }
        plan.served[r] = cands;
    }

    fn drop_request(&self, plan: &mut Plan, r: usize) {
        for p in std::mem::take(&mut plan.served[r]) {
            plan.release(self.program, p);
        }
    }

    fn swap_unit<R: Rng>(&self, plan: &mut Plan, r: usize, rng: &mut R) {
        let cands = self.free_candidates(plan, r);
        if cands.is_empty() {
            return;
        }
        let slot = rng.random_range(0..plan.served[r].len());
        let incoming = cands[rng.random_range(0..cands.len())];
        let outgoing = plan.served[r][slot];
        plan.release(self.program, outgoing);
        plan.assign(self.program, incoming);
        plan.served[r][slot] = incoming;
    }

    /// Trades one unit between two served requests when both new pairs
    /// exist.
    fn exchange<R: Rng>(&self, plan: &mut Plan, a: usize, rng: &mut R) {
        let others: Vec<usize> = (0..plan.served.len())
            .filter(|&b| b != a && !plan.served[b].is_empty())
            .collect();
        if others.is_empty() {
            return;
        }
        let b = others[rng.random_range(0..others.len())];
        let ia = rng.random_range(0..plan.served[a].len());
        let ib = rng.random_range(0..plan.served[b].len());
        let (pa, pb) = (plan.served[a][ia], plan.served[b][ib]);
        let (ua, ub) = (self.program.pairs[pa].unit, self.program.pairs[pb].unit);
        let (Some(&na), Some(&nb)) = (self.pair_of.get(&(ub, a)), self.pair_of.get(&(ua, b)))
        else {
            return;
        };
        plan.release(self.program, pa);
        plan.release(self.program, pb);
        plan.assign(self.program, na);
        plan.assign(self.program, nb);
        plan.served[a][ia] = na;
        plan.served[b][ib] = nb;
    }
}

impl AnnealProblem for PlanSearch<'_> {
    type Solution = Plan;
    /// `(shortage, quality)`.
    type Cost = (f64, f64);

    fn initial_solution<R: Rng>(&self, _rng: &mut R) -> Plan {
        Plan::from_selection(self.program, self.start.clone())
    }

    fn cost(&self, plan: &Plan) -> (f64, f64) {
        self.program
            .evaluate(&plan.sel)
            .map_or((f64::INFINITY, f64::INFINITY), |e| e.tiers())
    }

    fn improves(&self, candidate: (f64, f64), incumbent: (f64, f64)) -> bool {
        candidate.0.is_finite()
            && self.program.objective.compare(candidate, incumbent, EPS) == std::cmp::Ordering::Less
    }

    fn uphill(&self, from: (f64, f64), to: (f64, f64)) -> Option<f64> {
        if !to.0.is_finite() {
            return None;
        }
        match self.program.objective {
            // Coverage is never traded for quality.
            ObjectiveMode::Lexicographic if to.0 > from.0 + EPS => None,
            ObjectiveMode::Lexicographic => Some(to.1 - from.1),
            mode @ ObjectiveMode::ScaledSum { .. } => Some(mode.scalar(to) - mode.scalar(from)),
        }
    }

    fn neighbor<R: Rng>(&self, plan: &Plan, rng: &mut R) -> Plan {
        let mut next = plan.clone();
        let n_req = self.program.requests.len();
        if n_req == 0 {
            return next;
        }
        let r = rng.random_range(0..n_req);
        if next.served[r].is_empty() {
            self.serve(&mut next, r, rng);
        } else {
            match rng.random_range(0..3) {
                0 => self.drop_request(&mut next, r),
                1 => self.swap_unit(&mut next, r, rng),
                _ => self.exchange(&mut next, r, rng),
            }
        }
        next
    }
}

/// Annealing from a greedy construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnealingSolver;

impl AnnealingSolver {
    /// Anneals from `start`, which must be a valid selection.
    pub fn polish(
        &self,
        program: &AllocationProgram,
        config: &SolverConfig,
        start: Selection,
    ) -> SolveOutcome {
        let started = Instant::now();
        let search = PlanSearch::new(program, start);
        let scale = search.quality_scale();
        let annealer = Annealer::from_config(config).with_temperatures(scale, scale * 1e-4);
        let result = match annealer.run(&search, config.cancel.as_deref()) {
            Ok(result) => result,
            Err(msg) => {
                warn!(%msg, "annealing parameters rejected");
                return SolveOutcome::empty(SolverStatus::ModelInvalid);
            }
        };
        let status = if result.cancelled {
            SolverStatus::Timeout
        } else {
            SolverStatus::Feasible
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            %status,
            iterations = result.iterations,
            shortage = result.best_cost.0,
            quality = result.best_cost.1,
            elapsed_ms,
            "annealing finished"
        );
        SolveOutcome {
            status,
            pool: vec![result.best.sel],
            elapsed_ms,
            nodes: result.iterations as u64,
        }
    }
}

impl AllocationSolver for AnnealingSolver {
    fn name(&self) -> &str {
        "anneal"
    }

    fn solve(&self, program: &AllocationProgram, config: &SolverConfig) -> SolveOutcome {
        if let Err(msg) = program.validate() {
            warn!(%msg, "allocation program rejected");
            return SolveOutcome::empty(SolverStatus::ModelInvalid);
        }
        self.polish(program, config, greedy(program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::{Antigen, BloodProfile};
    use crate::config::MatchingConfig;
    use crate::inventory::{InventoryUnit, PatientGroup, Request, RequestId, UnitId};
    use crate::model::{Formulation, ProgramOptions};
    use std::sync::Arc;

    struct QuadraticProblem;

    impl AnnealProblem for QuadraticProblem {
        type Solution = f64;
        type Cost = f64;

        fn initial_solution<R: Rng>(&self, rng: &mut R) -> f64 {
            rng.random_range(-10.0..10.0)
        }

        fn cost(&self, x: &f64) -> f64 {
            x * x
        }

        fn neighbor<R: Rng>(&self, x: &f64, rng: &mut R) -> f64 {
            x + rng.random_range(-1.0..1.0)
        }

        fn improves(&self, candidate: f64, incumbent: f64) -> bool {
            candidate < incumbent
        }

        fn uphill(&self, from: f64, to: f64) -> Option<f64> {
            Some(to - from)
        }
    }

    #[test]
    fn test_quadratic_geometric() {
        let annealer = Annealer::new(42)
            .with_temperatures(100.0, 0.001)
            .with_iterations_per_temperature(50);
        let result = annealer.run(&QuadraticProblem, None).unwrap();
        assert!(result.best_cost < 1.0, "got {}", result.best_cost);
        assert!(result.improving_moves > 0);
    }

    #[test]
    fn test_quadratic_lundy_mees() {
        let (t0, t_min, max_iter) = (100.0, 0.001, 50_000);
        let beta = (t0 - t_min) / (max_iter as f64 * t0 * t_min);
        let annealer = Annealer::new(42)
            .with_temperatures(t0, t_min)
            .with_cooling(CoolingSchedule::LundyMees { beta })
            .with_max_iterations(max_iter);
        let result = annealer.run(&QuadraticProblem, None).unwrap();
        assert!(result.best_cost < 1.0, "got {}", result.best_cost);
    }

    #[test]
    fn test_linear_cooling_and_history() {
        let annealer = Annealer::new(42)
            .with_temperatures(50.0, 0.01)
            .with_cooling(CoolingSchedule::Linear)
            .with_max_iterations(10_000);
        let result = annealer.run(&QuadraticProblem, None).unwrap();
        assert!(result.iterations <= 10_000);
        for w in result.cost_history.windows(2) {
            assert!(w[1] <= w[0] + 1e-12);
        }
    }

    #[test]
    fn test_cancellation_and_bad_parameters() {
        let flag = AtomicBool::new(true);
        let result = Annealer::new(1).run(&QuadraticProblem, Some(&flag)).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.iterations, 0);

        assert!(Annealer::new(1)
            .with_temperatures(1.0, 2.0)
            .run(&QuadraticProblem, None)
            .is_err());
    }

    fn program() -> AllocationProgram {
        let f = Formulation::from_config(&MatchingConfig::default()).unwrap();
        let units: Vec<_> = (0..10)
            .map(|i| {
                let profile = if i % 3 == 0 {
                    BloodProfile::from_antigens(&[Antigen::K])
                } else {
                    BloodProfile::all_negative()
                };
                InventoryUnit::new(UnitId(i), profile, (i * 3) as u32)
            })
            .collect();
        let requests: Vec<_> = (0..4)
            .map(|i| {
                Request::new(
                    RequestId(i),
                    BloodProfile::all_negative(),
                    2,
                    0,
                    (i % 2) as u32,
                    PatientGroup::Other,
                )
                .unwrap()
            })
            .collect();
        AllocationProgram::build(&f, &units, &requests, ProgramOptions::online(0))
    }

    #[test]
    fn test_polish_never_worsens_the_start() {
        let program = program();
        let start = greedy(&program);
        let start_cost = program.objective.scalar(program.evaluate(&start).unwrap().tiers());
        let config = SolverConfig::default().with_anneal_iterations(3_000);
        let out = AnnealingSolver.polish(&program, &config, start);
        assert_eq!(out.status, SolverStatus::Feasible);
        let eval = program.evaluate(&out.pool[0]).expect("annealed plan stays valid");
        assert!(program.objective.scalar(eval.tiers()) <= start_cost + 1e-9);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let program = program();
        let config = SolverConfig::default().with_anneal_iterations(2_000).with_seed(9);
        let a = AnnealingSolver.solve(&program, &config);
        let b = AnnealingSolver.solve(&program, &config);
        assert_eq!(a.pool, b.pool);
    }

    #[test]
    fn test_cancelled_polish_reports_timeout() {
        let program = program();
        let config = SolverConfig::default().with_cancel(Arc::new(AtomicBool::new(true)));
        let out = AnnealingSolver.solve(&program, &config);
        assert_eq!(out.status, SolverStatus::Timeout);
        assert!(program.evaluate(&out.pool[0]).is_some());
    }

    #[test]
    fn test_lexicographic_moves_never_trade_coverage() {
        let program = program();
        let search = PlanSearch::new(&program, greedy(&program));
        assert!(search.quality_scale() > 0.0);

        assert!(search.improves((0.0, 9.0), (1.0, 0.0)));
        assert!(!search.improves((f64::INFINITY, 0.0), (1.0, 0.0)));
        assert_eq!(search.uphill((0.0, 1.0), (1.0, 0.0)), None);
        assert_eq!(search.uphill((0.0, 1.0), (f64::INFINITY, 0.0)), None);
        assert_eq!(search.uphill((2.0, 1.0), (2.0, 3.5)), Some(2.5));
    }

    #[test]
    fn test_scaled_sum_moves_weigh_both_tiers() {
        let config =
            MatchingConfig::default().with_objective(ObjectiveMode::ScaledSum { tier1_scale: 10.0 });
        let f = Formulation::from_config(&config).unwrap();
        let unit = InventoryUnit::new(UnitId(0), BloodProfile::all_negative(), 0);
        let request =
            Request::new(RequestId(0), BloodProfile::all_negative(), 1, 0, 0, PatientGroup::Other).unwrap();
        let program = AllocationProgram::build(&f, &[unit], &[request], ProgramOptions::online(0));
        let search = PlanSearch::new(&program, greedy(&program));

        assert_eq!(search.uphill((0.0, 1.0), (1.0, 0.0)), Some(9.0));
        assert!(search.improves((0.0, 5.0), (1.0, 0.0)));
        assert!(!search.improves((0.0, 11.0), (1.0, 0.0)));
    }
}
