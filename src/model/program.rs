//! Typed formulation of one allocation problem.
//!
//! Every feasible unit/request pair becomes an [`IssuePair`] carrying its
//! precomputed cost terms and mismatch mask, so solvers never touch
//! variable names. Shortage and mismatch variables are implied by a
//! [`Selection`]: a request is short when none of its pairs is chosen,
//! mismatched on antigen `k` when any chosen unit mismatches on `k`.

use super::linear::{LinearModel, Objective, Sense, VarId};
use crate::blood::{Antigen, AntigenPanel, PrevalenceTables, ANTIGEN_COUNT};
use crate::compat::CompatibilityEngine;
use crate::config::{FreshnessCurve, MatchingConfig, ObjectiveMode, WeightTable};
use crate::error::{MatchError, Result};
use crate::inventory::{InventoryUnit, PatientGroup, Request, RequestId, UnitId};
use serde::{Deserialize, Serialize};

/// Chosen issue pairs, indexed like [`AllocationProgram::pairs`].
pub type Selection = Vec<bool>;

/// Tolerance for objective comparisons.
pub const EPS: f64 = 1e-9;

/// Planning horizon of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Horizon {
    /// Rolling daily solve: only requests due on `day` issue units, later
    /// allocations are tentative.
    Online { day: u32 },
    /// One solve over the whole horizon with known unit arrival days.
    Offline,
}

impl Horizon {
    fn start_day(self) -> u32 {
        match self {
            Horizon::Online { day } => day,
            Horizon::Offline => 0,
        }
    }
}

/// Options for building one program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramOptions {
    pub horizon: Horizon,
    /// Forbid serving a request with a mismatch penalty above its
    /// `best_mismatch_penalty`.
    pub penalty_caps: bool,
}

impl ProgramOptions {
    pub fn online(day: u32) -> Self {
        Self {
            horizon: Horizon::Online { day },
            penalty_caps: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            horizon: Horizon::Offline,
            penalty_caps: false,
        }
    }

    pub fn with_penalty_caps(mut self) -> Self {
        self.penalty_caps = true;
        self
    }
}

/// Objective value split by term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveBreakdown {
    /// Tier 1: weighted shortages.
    pub shortage: f64,
    pub mismatch: f64,
    pub freshness: f64,
    pub usability: f64,
    pub substitution: f64,
}

impl ObjectiveBreakdown {
    /// Tier 2 total.
    pub fn quality(&self) -> f64 {
        self.mismatch + self.freshness + self.usability + self.substitution
    }

    pub fn tiers(&self) -> (f64, f64) {
        (self.shortage, self.quality())
    }

    pub fn add(&mut self, other: &ObjectiveBreakdown) {
        self.shortage += other.shortage;
        self.mismatch += other.mismatch;
        self.freshness += other.freshness;
        self.usability += other.usability;
        self.substitution += other.substitution;
    }
}

/// Per-pair objective coefficients.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PairCost {
    pub freshness: f64,
    /// `usability(unit) - usability(request)`.
    pub usability: f64,
    pub substitution: f64,
}

impl PairCost {
    #[inline]
    pub fn total(&self) -> f64 {
        self.freshness + self.usability + self.substitution
    }
}

/// A feasible unit/request pair, i.e. one issue variable `x[i,r]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuePair {
    /// Index into the unit slice the program was built from.
    pub unit: usize,
    /// Index into the request slice the program was built from.
    pub request: usize,
    pub cost: PairCost,
    /// Minor antigens mismatched by this pair.
    pub mismatch: u32,
    /// Unit age on the request's issuing day.
    pub issue_age: u32,
}

/// Per-request data: shortage weight, penalty cap and candidate pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSlot {
    pub id: RequestId,
    pub group: PatientGroup,
    pub num_units: u32,
    /// Counts as today's demand (always true offline).
    pub today: bool,
    /// Coefficient of `y[r]` in tier 1.
    pub shortage_weight: f64,
    /// Upper bound on the mismatch penalty when served.
    pub cap: Option<f64>,
    /// Indices into [`AllocationProgram::pairs`], in unit order.
    pub pairs: Vec<usize>,
    /// Cheapest single pair cost, `0.0` without candidates.
    pub min_pair_cost: f64,
    penalty: [f64; ANTIGEN_COUNT],
}

impl RequestSlot {
    /// Weighted penalty of mismatching on every antigen in `mask`.
    #[inline]
    pub fn mismatch_penalty(&self, mask: u32) -> f64 {
        let mut m = mask;
        let mut total = 0.0;
        while m != 0 {
            let k = m.trailing_zeros() as usize;
            total += self.penalty[k];
            m &= m - 1;
        }
        total
    }

    /// Penalty of a single antigen.
    pub fn antigen_penalty(&self, antigen: Antigen) -> f64 {
        self.penalty[antigen.index()]
    }
}

/// Resolved, immutable formulation inputs shared by every solve of a run.
#[derive(Debug, Clone)]
pub struct Formulation {
    pub engine: CompatibilityEngine,
    pub weights: WeightTable,
    pub prevalence: PrevalenceTables,
    pub panel: AntigenPanel,
    pub freshness: FreshnessCurve,
    pub max_age: u32,
    pub mismatch_multiplier: f64,
    pub shortage_penalty_scale: Option<f64>,
    pub objective: ObjectiveMode,
}

impl Formulation {
    /// Validates `config` and resolves its tables.
    pub fn from_config(config: &MatchingConfig) -> Result<Self> {
        config.validate().map_err(MatchError::InvalidConfig)?;
        let weights = config.weights.resolve()?;
        let engine = CompatibilityEngine::new(&weights, &config.panel, config.max_age);
        Ok(Self {
            engine,
            weights,
            prevalence: config.prevalence()?,
            panel: config.panel.clone(),
            freshness: config.freshness,
            max_age: config.max_age,
            mismatch_multiplier: config.mismatch_multiplier,
            shortage_penalty_scale: config.shortage_penalty_scale,
            objective: config.objective,
        })
    }

    /// Usability of a phenotype on the run's panel.
    pub fn usability(&self, profile: &crate::blood::BloodProfile) -> f64 {
        self.prevalence.usability(profile, self.panel.mask())
    }

    /// Weighted mismatch penalty of `mask` for `group`.
    pub fn mismatch_penalty(&self, group: PatientGroup, mask: u32) -> f64 {
        Antigen::MINOR
            .iter()
            .filter(|a| mask & a.bit() != 0)
            .map(|a| self.mismatch_multiplier * self.weights.soft(group, *a))
            .sum()
    }
}

/// One allocation problem ready for a solver.
#[derive(Debug, Clone)]
pub struct AllocationProgram {
    pub horizon: Horizon,
    pub objective: ObjectiveMode,
    pub pairs: Vec<IssuePair>,
    pub requests: Vec<RequestSlot>,
    unit_ids: Vec<UnitId>,
    /// `(panel-restricted phenotype, age, arrival day)` per unit; units with
    /// equal keys are interchangeable for every request.
    unit_keys: Vec<(u32, u32, u32)>,
}

impl AllocationProgram {
    /// Formulates the problem. Infeasible pairs get no variable.
    pub fn build(
        f: &Formulation,
        units: &[InventoryUnit],
        requests: &[Request],
        options: ProgramOptions,
    ) -> Self {
        let start = options.horizon.start_day();
        let matrix = f.engine.matrices(units, requests, start);
        let scale = f
            .shortage_penalty_scale
            .unwrap_or(requests.len() as f64);
        let panel_mask = f.panel.mask();
        let soft_mask = f.panel.minor_mask();

        let unit_usability: Vec<f64> = units.iter().map(|u| f.usability(&u.profile)).collect();

        let mut pairs = Vec::with_capacity(matrix.feasible_count());
        let mut slots = Vec::with_capacity(requests.len());
        for (r, req) in requests.iter().enumerate() {
            let (today, shortage_weight) = match options.horizon {
                Horizon::Online { day } => {
                    let due = req.is_due(day);
                    (due, if due { scale + 1.0 } else { 1.0 })
                }
                Horizon::Offline => (true, 1.0),
            };

            let mut penalty = [0.0; ANTIGEN_COUNT];
            for a in Antigen::MINOR {
                if soft_mask & a.bit() != 0 {
                    penalty[a.index()] = f.mismatch_multiplier * f.weights.soft(req.group, a);
                }
            }

            let req_usability = f.usability(&req.profile);
            let req_mask = req.profile.mask();
            let mut slot_pairs = Vec::new();
            let mut min_pair_cost = f64::INFINITY;
            for (i, unit) in units.iter().enumerate() {
                if !matrix.feasible(i, r) {
                    continue;
                }
                let unit_mask = unit.profile.mask();
                let issue_age = unit.age + (req.day_issuing - start.max(unit.arrival_day));
                let substitution = if req.group.is_flexible() {
                    Antigen::MINOR
                        .iter()
                        .filter(|a| soft_mask & a.bit() != 0)
                        .filter(|a| unit_mask & a.bit() == 0 && req_mask & a.bit() != 0)
                        .map(|a| f.weights.soft(req.group, *a))
                        .sum()
                } else {
                    0.0
                };
                let cost = PairCost {
                    freshness: f.freshness.penalty(issue_age, f.max_age),
                    usability: unit_usability[i] - req_usability,
                    substitution,
                };
                min_pair_cost = min_pair_cost.min(cost.total());
                slot_pairs.push(pairs.len());
                pairs.push(IssuePair {
                    unit: i,
                    request: r,
                    cost,
                    mismatch: f.engine.mismatch_mask(unit_mask, req),
                    issue_age,
                });
            }

            slots.push(RequestSlot {
                id: req.id,
                group: req.group,
                num_units: req.num_units,
                today,
                shortage_weight,
                cap: if options.penalty_caps {
                    req.best_mismatch_penalty
                } else {
                    None
                },
                pairs: slot_pairs,
                min_pair_cost: if min_pair_cost.is_finite() {
                    min_pair_cost
                } else {
                    0.0
                },
                penalty,
            });
        }

        Self {
            horizon: options.horizon,
            objective: f.objective,
            pairs,
            requests: slots,
            unit_ids: units.iter().map(|u| u.id).collect(),
            unit_keys: units
                .iter()
                .map(|u| (u.profile.mask() & panel_mask, u.age, u.arrival_day))
                .collect(),
        }
    }

    /// Checks that every coefficient is finite.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for pair in &self.pairs {
            let c = pair.cost;
            if !(c.freshness.is_finite() && c.usability.is_finite() && c.substitution.is_finite()) {
                return Err(format!(
                    "non-finite cost for unit {} and request {}",
                    self.unit_ids[pair.unit], self.requests[pair.request].id
                ));
            }
        }
        for slot in &self.requests {
            if !slot.shortage_weight.is_finite() || slot.penalty.iter().any(|w| !w.is_finite()) {
                return Err(format!("non-finite weight for request {}", slot.id));
            }
            if slot.cap.is_some_and(|c| !c.is_finite()) {
                return Err(format!("non-finite penalty cap for request {}", slot.id));
            }
        }
        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.unit_ids.len()
    }

    pub fn unit_id(&self, unit: usize) -> UnitId {
        self.unit_ids[unit]
    }

    /// Interchangeability key of a unit.
    pub fn unit_key(&self, unit: usize) -> (u32, u32, u32) {
        self.unit_keys[unit]
    }

    /// The all-short selection.
    pub fn empty_selection(&self) -> Selection {
        vec![false; self.pairs.len()]
    }

    /// Chosen pair indices grouped per request.
    pub fn plan(&self, sel: &[bool]) -> Vec<Vec<usize>> {
        self.requests
            .iter()
            .map(|s| s.pairs.iter().copied().filter(|&p| sel[p]).collect())
            .collect()
    }

    /// Objective of a selection, or `None` when it violates single use, the
    /// all-or-nothing quantity rule or a penalty cap.
    pub fn evaluate(&self, sel: &[bool]) -> Option<ObjectiveBreakdown> {
        if sel.len() != self.pairs.len() {
            return None;
        }
        let mut used = vec![false; self.unit_count()];
        for (p, pair) in self.pairs.iter().enumerate() {
            if sel[p] {
                if used[pair.unit] {
                    return None;
                }
                used[pair.unit] = true;
            }
        }

        let mut out = ObjectiveBreakdown::default();
        for slot in &self.requests {
            let mut count = 0u32;
            let mut mask = 0u32;
            let mut costs = PairCost::default();
            for &p in &slot.pairs {
                if sel[p] {
                    let pair = &self.pairs[p];
                    count += 1;
                    mask |= pair.mismatch;
                    costs.freshness += pair.cost.freshness;
                    costs.usability += pair.cost.usability;
                    costs.substitution += pair.cost.substitution;
                }
            }
            if count == 0 {
                out.shortage += slot.shortage_weight;
                continue;
            }
            if count != slot.num_units {
                return None;
            }
            let penalty = slot.mismatch_penalty(mask);
            if slot.cap.is_some_and(|cap| penalty > cap + EPS) {
                return None;
            }
            out.mismatch += penalty;
            out.freshness += costs.freshness;
            out.usability += costs.usability;
            out.substitution += costs.substitution;
        }
        Some(out)
    }

    /// Mismatch penalty of the requests counted as today's demand.
    pub fn today_mismatch(&self, sel: &[bool]) -> f64 {
        self.requests
            .iter()
            .filter(|s| s.today)
            .map(|s| {
                let mask = s
                    .pairs
                    .iter()
                    .filter(|&&p| sel[p])
                    .fold(0, |m, &p| m | self.pairs[p].mismatch);
                s.mismatch_penalty(mask)
            })
            .sum()
    }

    /// Chosen pairs serving today's demand.
    pub fn today_pairs<'a>(&'a self, sel: &'a [bool]) -> impl Iterator<Item = &'a IssuePair> + 'a {
        self.requests
            .iter()
            .filter(|s| s.today)
            .flat_map(move |s| s.pairs.iter().filter(move |&&p| sel[p]))
            .map(move |&p| &self.pairs[p])
    }

    /// Expands a selection into values for every variable of [`Self::linear`].
    pub fn full_assignment(&self, sel: &[bool]) -> Vec<bool> {
        let mut values = sel.to_vec();
        let plan = self.plan(sel);
        values.extend(plan.iter().map(|chosen| chosen.is_empty()));
        for (slot, chosen) in self.requests.iter().zip(&plan) {
            let mask = chosen.iter().fold(0, |m, &p| m | self.pairs[p].mismatch);
            for a in self.mismatch_antigens(slot) {
                values.push(mask & a.bit() != 0);
            }
        }
        values
    }

    /// Antigens that some candidate of `slot` mismatches on; these get a
    /// `z` variable.
    fn mismatch_antigens(&self, slot: &RequestSlot) -> impl Iterator<Item = Antigen> {
        let any = slot
            .pairs
            .iter()
            .fold(0, |m, &p| m | self.pairs[p].mismatch);
        Antigen::MINOR.into_iter().filter(move |a| any & a.bit() != 0)
    }

    /// Exports the problem as a binary linear program.
    ///
    /// Variables are laid out as all `x` (one per pair), then one `y` per
    /// request, then the `z` variables request by request.
    ///
    /// Besides the coverage row `Σx + n·y ≥ n`, every request gets the row
    /// `Σx + n·y ≤ n`, so a request is served in full or not at all. This is
    /// stricter than coverage alone, which lets a short request keep a
    /// partial allocation.
    pub fn linear(&self) -> LinearModel {
        let mut model = LinearModel::new(match self.horizon {
            Horizon::Online { day } => format!("allocation_day_{day}"),
            Horizon::Offline => "allocation_offline".to_string(),
        });

        for pair in &self.pairs {
            model.add_var(format!(
                "x[{},{}]",
                self.unit_ids[pair.unit], self.requests[pair.request].id
            ));
        }
        let y: Vec<VarId> = self
            .requests
            .iter()
            .map(|s| model.add_var(format!("y[{}]", s.id)))
            .collect();

        let mut tier1 = Vec::with_capacity(self.requests.len());
        let mut tier2 = Vec::new();
        for (p, pair) in self.pairs.iter().enumerate() {
            tier2.push((VarId(p), pair.cost.total()));
        }

        for (r, slot) in self.requests.iter().enumerate() {
            let n = f64::from(slot.num_units);
            let xs: Vec<(VarId, f64)> = slot.pairs.iter().map(|&p| (VarId(p), 1.0)).collect();

            let mut cover = xs.clone();
            cover.push((y[r], n));
            model.add_row(format!("cover[{}]", slot.id), cover.clone(), Sense::Ge, n);
            // Σx ≤ n(1 − y): all or nothing.
            model.add_row(format!("exact[{}]", slot.id), cover, Sense::Le, n);
            tier1.push((y[r], slot.shortage_weight));

            let mut cap_terms = Vec::new();
            for a in self.mismatch_antigens(slot).collect::<Vec<_>>() {
                let z = model.add_var(format!("z[{},{}]", slot.id, a));
                let mut row: Vec<(VarId, f64)> = slot
                    .pairs
                    .iter()
                    .filter(|&&p| self.pairs[p].mismatch & a.bit() != 0)
                    .map(|&p| (VarId(p), 1.0))
                    .collect();
                row.push((z, -n));
                model.add_row(format!("mismatch[{},{}]", slot.id, a), row, Sense::Le, 0.0);
                let w = slot.antigen_penalty(a);
                tier2.push((z, w));
                cap_terms.push((z, w));
            }
            if let Some(cap) = slot.cap {
                model.add_row(format!("cap[{}]", slot.id), cap_terms, Sense::Le, cap);
            }
        }

        let mut per_unit: Vec<Vec<(VarId, f64)>> = vec![Vec::new(); self.unit_count()];
        for (p, pair) in self.pairs.iter().enumerate() {
            per_unit[pair.unit].push((VarId(p), 1.0));
        }
        for (i, terms) in per_unit.into_iter().enumerate() {
            if terms.len() > 1 {
                model.add_row(format!("single[{}]", self.unit_ids[i]), terms, Sense::Le, 1.0);
            }
        }

        model.set_objective(match self.objective {
            ObjectiveMode::Lexicographic => Objective::Hierarchical {
                objectives: vec![
                    Objective::Minimize { terms: tier1 },
                    Objective::Minimize { terms: tier2 },
                ],
            },
            ObjectiveMode::ScaledSum { tier1_scale } => {
                let mut terms: Vec<(VarId, f64)> = tier1
                    .into_iter()
                    .map(|(v, w)| (v, w * tier1_scale))
                    .collect();
                terms.extend(tier2);
                Objective::Minimize { terms }
            }
        });
        model
    }
}
