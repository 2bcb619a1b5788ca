//! Depth-first branch and bound over requests.
//!
//! Requests are branched one at a time, today's demand and the most
//! constrained requests first. Each request is either served by a
//! combination of exactly `num_units` free candidate units or left short.
//! Units with equal interchangeability keys are never enumerated in more
//! than one order, which removes the symmetric duplicates that identical
//! donor phenotypes would otherwise create.

use super::{AllocationSolver, SolveOutcome, SolverConfig, SolverStatus};
use crate::config::ObjectiveMode;
use crate::model::{AllocationProgram, Selection, EPS};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

const CHECK_INTERVAL: u64 = 1024;

/// Exact search with an equally-optimal pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSolver;

impl AllocationSolver for ExactSolver {
    fn name(&self) -> &str {
        "exact"
    }

    fn solve(&self, program: &AllocationProgram, config: &SolverConfig) -> SolveOutcome {
        let started = Instant::now();
        if let Err(msg) = program.validate() {
            warn!(%msg, "allocation program rejected");
            return SolveOutcome::empty(SolverStatus::ModelInvalid);
        }

        let mut search = Search::new(program, config, started);
        let incumbent = greedy(program);
        if let Some(eval) = program.evaluate(&incumbent) {
            search.best = Some(eval.tiers());
            search.pool.push(incumbent);
        }
        search.dfs(0, 0.0, 0.0);

        let status = if search.aborted {
            SolverStatus::Timeout
        } else {
            SolverStatus::Optimal
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            %status,
            nodes = search.nodes,
            pool = search.pool.len(),
            elapsed_ms,
            "exact search finished"
        );
        SolveOutcome {
            status,
            pool: search.pool,
            elapsed_ms,
            nodes: search.nodes,
        }
    }
}

/// Branching order: today's requests first, then fewest candidates.
fn request_order(program: &AllocationProgram) -> Vec<usize> {
    let mut order: Vec<usize> = (0..program.requests.len()).collect();
    order.sort_by_key(|&r| {
        let slot = &program.requests[r];
        (!slot.today, slot.pairs.len(), r)
    });
    order
}

/// Pair preference for one request: own cost plus the penalty of its
/// mismatches, then interchangeability key.
fn ranked_candidates(
    program: &AllocationProgram,
    request: usize,
    used: &[bool],
) -> Vec<(f64, usize)> {
    let slot = &program.requests[request];
    let mut cands: Vec<(f64, usize)> = slot
        .pairs
        .iter()
        .copied()
        .filter(|&p| !used[program.pairs[p].unit])
        .map(|p| {
            let pair = &program.pairs[p];
            (pair.cost.total() + slot.mismatch_penalty(pair.mismatch), p)
        })
        .collect();
    cands.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| {
                program
                    .unit_key(program.pairs[a.1].unit)
                    .cmp(&program.unit_key(program.pairs[b.1].unit))
            })
            .then(a.1.cmp(&b.1))
    });
    cands
}

/// Serves requests in branching order with their cheapest free units.
pub(super) fn greedy(program: &AllocationProgram) -> Selection {
    let mut sel = program.empty_selection();
    let mut used = vec![false; program.unit_count()];
    for r in request_order(program) {
        let slot = &program.requests[r];
        let n = slot.num_units as usize;
        let cands = ranked_candidates(program, r, &used);
        if cands.len() < n {
            continue;
        }
        let chosen: Vec<usize> = cands.iter().take(n).map(|&(_, p)| p).collect();
        let mask = chosen.iter().fold(0, |m, &p| m | program.pairs[p].mismatch);
        if slot
            .cap
            .is_some_and(|cap| slot.mismatch_penalty(mask) > cap + EPS)
        {
            continue;
        }
        for p in chosen {
            sel[p] = true;
            used[program.pairs[p].unit] = true;
        }
    }
    sel
}

struct Search<'a> {
    program: &'a AllocationProgram,
    config: &'a SolverConfig,
    mode: ObjectiveMode,
    order: Vec<usize>,
    /// Lower bound on the quality tier contributed by `order[d..]`.
    suffix_quality: Vec<f64>,
    used: Vec<bool>,
    sel: Selection,
    best: Option<(f64, f64)>,
    pool: Vec<Selection>,
    nodes: u64,
    started: Instant,
    aborted: bool,
}

impl<'a> Search<'a> {
    fn new(program: &'a AllocationProgram, config: &'a SolverConfig, started: Instant) -> Self {
        let order = request_order(program);
        let mut suffix_quality = vec![0.0; order.len() + 1];
        for d in (0..order.len()).rev() {
            let slot = &program.requests[order[d]];
            let serve = f64::from(slot.num_units) * slot.min_pair_cost;
            suffix_quality[d] = suffix_quality[d + 1] + serve.min(0.0);
        }
        Self {
            program,
            config,
            mode: program.objective,
            order,
            suffix_quality,
            used: vec![false; program.unit_count()],
            sel: program.empty_selection(),
            best: None,
            pool: Vec::new(),
            nodes: 0,
            started,
            aborted: false,
        }
    }

    fn tick(&mut self) {
        self.nodes += 1;
        if self.nodes >= self.config.node_limit {
            self.aborted = true;
        } else if self.nodes.is_multiple_of(CHECK_INTERVAL)
            && (self.config.is_cancelled()
                || self.started.elapsed().as_millis() as u64 >= self.config.time_limit_ms)
        {
            self.aborted = true;
        }
    }

    /// Shortage weight of remaining requests that cannot be served from the
    /// free units whatever happens.
    fn forced_shortage(&self, depth: usize) -> f64 {
        self.order[depth..]
            .iter()
            .map(|&r| &self.program.requests[r])
            .filter(|slot| {
                let free = slot
                    .pairs
                    .iter()
                    .filter(|&&p| !self.used[self.program.pairs[p].unit])
                    .count();
                free < slot.num_units as usize
            })
            .map(|slot| slot.shortage_weight)
            .sum()
    }

    fn promising(&self, depth: usize, t1: f64, t2: f64) -> bool {
        let Some(best) = self.best else {
            return true;
        };
        let bound = (
            t1 + self.forced_shortage(depth),
            t2 + self.suffix_quality[depth],
        );
        match self.mode.compare(bound, best, EPS) {
            Ordering::Less => true,
            Ordering::Equal => self.pool.len() < self.config.pool_size,
            Ordering::Greater => false,
        }
    }

    fn offer(&mut self, cost: (f64, f64)) {
        match self.best.map(|b| self.mode.compare(cost, b, EPS)) {
            None | Some(Ordering::Less) => {
                self.best = Some(cost);
                self.pool.clear();
                self.pool.push(self.sel.clone());
            }
            Some(Ordering::Equal) => {
                if self.pool.len() < self.config.pool_size && !self.pool.contains(&self.sel) {
                    self.pool.push(self.sel.clone());
                }
            }
            Some(Ordering::Greater) => {}
        }
    }

    fn dfs(&mut self, depth: usize, t1: f64, t2: f64) {
        if self.aborted {
            return;
        }
        self.tick();
        if depth == self.order.len() {
            self.offer((t1, t2));
            return;
        }
        if !self.promising(depth, t1, t2) {
            return;
        }

        let r = self.order[depth];
        let n = self.program.requests[r].num_units as usize;
        let cands: Vec<usize> = ranked_candidates(self.program, r, &self.used)
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        if cands.len() >= n {
            let mut chosen = Vec::with_capacity(n);
            self.combine(depth, &cands, 0, &mut chosen, n, (t1, t2), 0, 0.0);
        }

        let short = self.program.requests[r].shortage_weight;
        self.dfs(depth + 1, t1 + short, t2);
    }

    /// Enumerates `remaining` more candidates from `cands[start..]`,
    /// skipping adjacent interchangeable units.
    #[allow(clippy::too_many_arguments)]
    fn combine(
        &mut self,
        depth: usize,
        cands: &[usize],
        start: usize,
        chosen: &mut Vec<usize>,
        remaining: usize,
        cost: (f64, f64),
        mask: u32,
        pair_cost: f64,
    ) {
        if self.aborted {
            return;
        }
        if remaining == 0 {
            let slot = &self.program.requests[self.order[depth]];
            let penalty = slot.mismatch_penalty(mask);
            if slot.cap.is_some_and(|cap| penalty > cap + EPS) {
                return;
            }
            for &p in chosen.iter() {
                self.sel[p] = true;
                self.used[self.program.pairs[p].unit] = true;
            }
            self.dfs(depth + 1, cost.0, cost.1 + pair_cost + penalty);
            for &p in chosen.iter() {
                self.sel[p] = false;
                self.used[self.program.pairs[p].unit] = false;
            }
            return;
        }
        let program = self.program;
        let key = |p: usize| program.unit_key(program.pairs[p].unit);
        for i in start..=cands.len() - remaining {
            if i > start && key(cands[i]) == key(cands[i - 1]) {
                continue;
            }
            let pair = &program.pairs[cands[i]];
            let (next_mask, next_cost) = (mask | pair.mismatch, pair_cost + pair.cost.total());
            chosen.push(cands[i]);
            self.combine(
                depth,
                cands,
                i + 1,
                chosen,
                remaining - 1,
                cost,
                next_mask,
                next_cost,
            );
            chosen.pop();
            if self.aborted {
                return;
            }
        }
    }
}
