//! Hospitals supplied by a shared distribution center.
//!
//! Each day runs four phases:
//!
//! 1. every hospital solves against its own stock;
//! 2. the center solves the requests hospitals propagated, never matching
//!    worse than the hospital's own best;
//! 3. every hospital re-solves without the requests the center covered,
//!    then issues and ages its stock;
//! 4. the center ships each hospital its shortfall, committed units first,
//!    then ages and restocks itself.

use super::transport::plan_transport;
use super::{ensure_solvable, restore_locations, EchelonCoordinator, Location, LocationKind};
use crate::checkpoint::Checkpoint;
use crate::config::SimulationConfig;
use crate::error::{MatchError, Result};
use crate::inventory::{IdMint, Request, RequestId, UnitId};
use crate::model::{AllocationModel, ProgramOptions};
use crate::report::DayReport;
use crate::scenario::{DemandSource, SupplySource};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Whether a hospital hands a request to the center after its own solve.
///
/// Requests due today stay local. Later requests go up when the hospital
/// could not serve them, or when a strict patient group got a mismatch.
pub fn should_propagate(request: &Request, served: bool, day: u32) -> bool {
    if request.day_issuing <= day {
        return false;
    }
    let imperfect = request.group.is_strict() && request.best_mismatch_penalty.is_some_and(|p| p > 0.0);
    !served || imperfect
}

pub struct MultiEchelonCoordinator {
    model: AllocationModel,
    config: SimulationConfig,
    hospitals: Vec<Location>,
    dc: Location,
    demand: Vec<Box<dyn DemandSource>>,
    supply: Box<dyn SupplySource>,
    mint: IdMint,
    day: u32,
    episode: u32,
}

impl MultiEchelonCoordinator {
    /// Builds and fills every location. `demand` holds one source per
    /// hospital, in `config.hospitals` order.
    pub fn new(
        model: AllocationModel,
        config: SimulationConfig,
        demand: Vec<Box<dyn DemandSource>>,
        supply: impl SupplySource + 'static,
    ) -> Result<Self> {
        config.validate().map_err(MatchError::InvalidConfig)?;
        let Some(dc_capacity) = config.dc_capacity else {
            return Err(MatchError::InvalidConfig(
                "a multi-echelon run needs a distribution center capacity".into(),
            ));
        };
        if demand.len() != config.hospitals.len() {
            return Err(MatchError::InvalidConfig(format!(
                "{} demand sources for {} hospitals",
                demand.len(),
                config.hospitals.len()
            )));
        }

        let max_age = model.formulation().max_age;
        let mut supply: Box<dyn SupplySource> = Box::new(supply);
        let mut mint = IdMint::new();
        let mut hospitals = Vec::with_capacity(config.hospitals.len());
        for h in &config.hospitals {
            let mut loc = Location::new(h.name.clone(), LocationKind::Hospital, h.capacity, max_age);
            loc.fill(supply.as_mut(), &mut mint)?;
            hospitals.push(loc);
        }
        let mut dc = Location::new("dc", LocationKind::DistributionCenter, dc_capacity, max_age);
        dc.fill(supply.as_mut(), &mut mint)?;

        Ok(Self {
            model,
            config,
            hospitals,
            dc,
            demand,
            supply,
            mint,
            day: 0,
            episode: 0,
        })
    }

    pub fn with_episode(mut self, episode: u32) -> Self {
        self.episode = episode;
        self
    }

    pub fn hospitals(&self) -> &[Location] {
        &self.hospitals
    }

    pub fn distribution_center(&self) -> &Location {
        &self.dc
    }

    /// Phase A: local solves. Returns the propagated requests with their
    /// hospital index.
    fn solve_locally(&mut self, day: u32) -> Result<Vec<(usize, Request)>> {
        let mut propagated = Vec::new();
        for (h, loc) in self.hospitals.iter_mut().enumerate() {
            let incoming = self.demand[h].draw(day, &mut self.mint)?;
            let expired = loc.requests.refresh(day, incoming)?;
            if !expired.is_empty() {
                debug!(day, hospital = %loc.name, dropped = expired.len(), "past-due requests dropped");
            }
            for r in loc.requests.iter_mut() {
                r.allocated_from_dc = false;
            }

            let a = self.model.solve(loc.ledger.units(), loc.requests.as_slice(), day);
            ensure_solvable(a.status, &loc.name, day)?;
            loc.record_allocation(&a);
            for o in &a.outcomes {
                if let Some(r) = loc.requests.get(o.request) {
                    if should_propagate(r, o.served, day) {
                        propagated.push((h, r.clone()));
                    }
                }
            }
        }
        Ok(propagated)
    }

    /// Phase B: the center solves the propagated requests. Returns units
    /// committed to requests due tomorrow, by hospital.
    fn solve_centrally(
        &mut self,
        day: u32,
        propagated: &[(usize, Request)],
        report: &mut DayReport,
    ) -> Result<Vec<(usize, UnitId)>> {
        let mut forced = Vec::new();
        if propagated.is_empty() {
            return Ok(forced);
        }
        let requests: Vec<Request> = propagated.iter().map(|(_, r)| r.clone()).collect();
        let a = self.model.solve_with(
            self.dc.ledger.units(),
            &requests,
            ProgramOptions::online(day).with_penalty_caps(),
        );
        ensure_solvable(a.status, &self.dc.name, day)?;
        report.status = a.status;
        report.pool_size = a.pool_size;
        report.elapsed_ms = a.elapsed_ms;
        report.objective = a.objective;

        for (o, (h, r)) in a.outcomes.iter().zip(propagated) {
            if !o.served {
                continue;
            }
            if let Some(pending) = self.hospitals[*h].requests.get_mut(o.request) {
                pending.allocated_from_dc = true;
                pending.best_mismatch_penalty = Some(o.mismatch_penalty);
            }
            report.dc_covered.push(o.request);
            if r.day_issuing == day + 1 {
                forced.extend(o.units.iter().map(|u| (*h, *u)));
            }
        }
        debug!(
            day,
            propagated = propagated.len(),
            covered = report.dc_covered.len(),
            forced = forced.len(),
            "distribution center solved"
        );
        Ok(forced)
    }

    /// Phase C: hospitals re-solve what the center did not cover, issue
    /// and age.
    fn solve_remaining(&mut self, day: u32, reports: &mut [DayReport]) -> Result<()> {
        for (loc, report) in self.hospitals.iter_mut().zip(reports.iter_mut()) {
            let covered: Vec<RequestId> = loc
                .requests
                .iter()
                .filter(|r| r.allocated_from_dc)
                .map(|r| r.id)
                .collect();
            let pending: Vec<Request> = loc
                .requests
                .iter()
                .filter(|r| !r.allocated_from_dc)
                .cloned()
                .collect();

            let a = self.model.solve(loc.ledger.units(), &pending, day);
            ensure_solvable(a.status, &loc.name, day)?;
            report.record_assignment(&a, loc.ledger.units(), &pending, loc.ledger.capacity());
            report.dc_covered = covered;
            loc.record_allocation(&a);

            let turnover = loc.ledger.age_and_expire(&a.issued_today())?;
            report.record_turnover(&turnover);
        }
        Ok(())
    }

    /// Phase D: ship to hospitals, then age and restock the center.
    fn restock(
        &mut self,
        day: u32,
        forced: &[(usize, UnitId)],
        reports: &mut [DayReport],
        dc_report: &mut DayReport,
    ) -> Result<()> {
        let shortfalls: Vec<usize> = self.hospitals.iter().map(|h| h.ledger.shortfall()).collect();
        let plan = plan_transport(self.model.formulation(), self.dc.ledger.units(), forced, &shortfalls);
        if plan.held_back > 0 {
            debug!(day, held_back = plan.held_back, "committed units exceed hospital shortfall");
        }

        let destination: HashMap<UnitId, usize> = plan.destinations().collect();
        let shipped: Vec<UnitId> = plan.destinations().map(|(u, _)| u).collect();
        let turnover = self.dc.ledger.age_and_expire(&shipped)?;
        dc_report.record_turnover(&turnover);
        dc_report.shipped = turnover.issued.len();

        let mut incoming = vec![Vec::new(); self.hospitals.len()];
        for unit in turnover.issued {
            let Some(&h) = destination.get(&unit.id) else {
                return Err(MatchError::data(format!("unit {} shipped without destination", unit.id)));
            };
            incoming[h].push(unit.with_arrival_day(day + 1));
        }
        for ((loc, units), report) in self.hospitals.iter_mut().zip(incoming).zip(reports.iter_mut()) {
            report.supplied = units.len();
            loc.ledger.replenish(units)?;
            if loc.ledger.shortfall() > 0 {
                warn!(day, hospital = %loc.name, missing = loc.ledger.shortfall(), "distribution center ran short");
            }
            report.inventory_end = loc.ledger.len();
        }

        dc_report.supplied = self.dc.restock(self.supply.as_mut(), &mut self.mint, day)?;
        dc_report.inventory_end = self.dc.ledger.len();
        Ok(())
    }
}

impl EchelonCoordinator for MultiEchelonCoordinator {
    fn step(&mut self) -> Result<Vec<DayReport>> {
        let day = self.day;
        let warm_up = day < self.config.init_days;
        let mut reports: Vec<DayReport> = self
            .hospitals
            .iter()
            .map(|h| DayReport::new(day, h.name.clone(), warm_up))
            .collect();
        let mut dc_report = DayReport::new(day, self.dc.name.clone(), warm_up);

        let propagated = self.solve_locally(day)?;
        let forced = self.solve_centrally(day, &propagated, &mut dc_report)?;
        self.solve_remaining(day, &mut reports)?;
        self.restock(day, &forced, &mut reports, &mut dc_report)?;

        debug!(
            day,
            issued = reports.iter().map(DayReport::units_issued).sum::<usize>(),
            shortages = reports.iter().map(|r| r.shortages).sum::<usize>(),
            shipped = dc_report.shipped,
            "day complete"
        );
        reports.push(dc_report);
        self.day += 1;
        Ok(reports)
    }

    fn day(&self) -> u32 {
        self.day
    }

    fn episode(&self) -> u32 {
        self.episode
    }

    fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut locations = self.hospitals.clone();
        locations.push(self.dc.clone());
        Checkpoint {
            episode: self.episode,
            day: self.day,
            mint: self.mint.clone(),
            locations,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let mut targets: Vec<&mut Location> = self.hospitals.iter_mut().collect();
        targets.push(&mut self.dc);
        restore_locations(&mut targets, checkpoint.locations)?;
        self.day = checkpoint.day;
        self.mint = checkpoint.mint;
        self.episode = checkpoint.episode;
        Ok(())
    }
}

impl std::fmt::Debug for MultiEchelonCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEchelonCoordinator")
            .field("episode", &self.episode)
            .field("day", &self.day)
            .field("hospitals", &self.hospitals.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::{Antigen, BloodProfile, MajorGroup};
    use crate::config::{HospitalConfig, MatchingConfig, WeightStrategy};
    use crate::inventory::PatientGroup;
    use crate::scenario::{RequestSpec, ScriptedDemand, ScriptedSupply};

    fn request(group: PatientGroup, issuing: u32, penalty: Option<f64>) -> Request {
        let mut r = Request::new(RequestId(1), BloodProfile::all_negative(), 1, 0, issuing, group).unwrap();
        r.best_mismatch_penalty = penalty;
        r
    }

    #[test]
    fn test_propagation_rules() {
        // Due today never leaves the hospital.
        assert!(!should_propagate(&request(PatientGroup::Other, 0, None), false, 0));
        // Short later requests go up.
        assert!(should_propagate(&request(PatientGroup::Other, 2, None), false, 0));
        // Served flexible requests stay even with a mismatch.
        assert!(!should_propagate(&request(PatientGroup::Other, 2, Some(3.0)), true, 0));
        // Strict groups go up on any mismatch.
        assert!(should_propagate(&request(PatientGroup::Scd, 2, Some(3.0)), true, 0));
        assert!(!should_propagate(&request(PatientGroup::Scd, 2, Some(0.0)), true, 0));
    }

    fn sim(days: u32) -> SimulationConfig {
        SimulationConfig::default()
            .with_days(0, days)
            .with_hospitals(vec![HospitalConfig::new("h0", 2), HospitalConfig::new("h1", 2)])
            .with_dc_capacity(6)
    }

    #[test]
    fn test_demand_source_count_must_match() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let r = MultiEchelonCoordinator::new(
            model,
            sim(1),
            vec![Box::new(ScriptedDemand::none())],
            ScriptedSupply::uniform(BloodProfile::all_negative()),
        );
        assert!(matches!(r, Err(MatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_center_covers_and_ships_tomorrows_request() {
        let config = MatchingConfig::default().with_weights(WeightStrategy::patient_groups());
        let model = AllocationModel::new(&config).unwrap();
        // Hospitals hold only K-positive units; the SCD patient due tomorrow
        // must match K, so only the center's K-negative units can serve it.
        let k_pos = BloodProfile::with_group(MajorGroup::ONeg, &[Antigen::K]);
        let patient = BloodProfile::with_group(MajorGroup::ONeg, &[]);
        let supply = ScriptedSupply::uniform(patient)
            .with_day(0, vec![k_pos, k_pos, k_pos, k_pos]);
        let demand: Vec<Box<dyn DemandSource>> = vec![
            Box::new(ScriptedDemand::new(vec![
                RequestSpec::new(k_pos, 2, 0, 0, PatientGroup::Other),
                RequestSpec::new(patient, 2, 0, 1, PatientGroup::Scd),
            ])),
            Box::new(ScriptedDemand::none()),
        ];
        let mut c = MultiEchelonCoordinator::new(model, sim(2), demand, supply).unwrap();
        assert!(c.hospitals().iter().all(|h| h.ledger.units().iter().all(|u| u.profile == k_pos)));

        let day0 = c.step().unwrap();
        assert_eq!(day0.len(), 3);
        assert_eq!(day0[2].dc_covered.len(), 1);
        assert_eq!(day0[0].dc_covered.len(), 1);
        assert_eq!(day0[0].units_issued(), 2);
        // The units committed to tomorrow's request arrive with the restock.
        assert_eq!(day0[0].supplied, 2);
        assert!(c.hospitals()[0].ledger.units().iter().all(|u| u.profile == patient));
        assert_eq!(c.distribution_center().ledger.len(), 6);

        let day1 = c.step().unwrap();
        assert_eq!(day1[0].shortages, 0);
        assert_eq!(day1[0].units_issued(), 2);
        assert!(day1[0].issued.iter().all(|p| p.unit_group == MajorGroup::ONeg));
    }

    #[test]
    fn test_committed_units_beyond_shortfall_stay_at_center() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let k_pos = BloodProfile::with_group(MajorGroup::ONeg, &[Antigen::K]);
        let patient = BloodProfile::with_group(MajorGroup::ONeg, &[]);
        let supply = ScriptedSupply::uniform(patient).with_day(0, vec![k_pos, k_pos, k_pos, k_pos]);
        let demand: Vec<Box<dyn DemandSource>> = vec![
            Box::new(ScriptedDemand::new(vec![RequestSpec::new(patient, 2, 0, 1, PatientGroup::Scd)])),
            Box::new(ScriptedDemand::none()),
        ];
        let mut c = MultiEchelonCoordinator::new(model, sim(1), demand, supply).unwrap();
        let day0 = c.step().unwrap();
        assert_eq!(day0[2].dc_covered.len(), 1);
        assert_eq!(day0[0].supplied, 0);
        assert_eq!(c.hospitals()[0].ledger.len(), 2);
        assert_eq!(c.distribution_center().ledger.len(), 6);
    }

    #[test]
    fn test_capacity_and_conservation_across_locations() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let p = BloodProfile::all_negative();
        let demand: Vec<Box<dyn DemandSource>> = vec![
            Box::new(ScriptedDemand::new(
                (0..4).map(|d| RequestSpec::new(p, 1, d, d, PatientGroup::Other)).collect(),
            )),
            Box::new(ScriptedDemand::new(
                (0..4).map(|d| RequestSpec::new(p, 2, d, d + 1, PatientGroup::Mds)).collect(),
            )),
        ];
        let mut c = MultiEchelonCoordinator::new(model, sim(4), demand, ScriptedSupply::uniform(p)).unwrap();
        for _ in 0..4 {
            let reports = c.step().unwrap();
            for r in &reports[..2] {
                assert_eq!(r.inventory_end, 2);
                assert_eq!(r.shortages, 0);
            }
            let shipped = reports[2].shipped;
            let received: usize = reports[..2].iter().map(|r| r.supplied).sum();
            assert_eq!(shipped, received);
            assert_eq!(reports[2].inventory_end, 6);
        }
    }
}
