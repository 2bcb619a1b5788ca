//! One hospital restocked from an external supply stream.

use super::{ensure_solvable, restore_locations, EchelonCoordinator, Location, LocationKind};
use crate::checkpoint::Checkpoint;
use crate::config::SimulationConfig;
use crate::error::{MatchError, Result};
use crate::inventory::IdMint;
use crate::model::AllocationModel;
use crate::report::DayReport;
use crate::scenario::{DemandSource, SupplySource};
use tracing::debug;

/// Runs the daily cycle for a single location: refresh requests, solve,
/// issue and age, restock.
pub struct SingleSiteCoordinator {
    model: AllocationModel,
    config: SimulationConfig,
    site: Location,
    demand: Box<dyn DemandSource>,
    supply: Box<dyn SupplySource>,
    mint: IdMint,
    day: u32,
    episode: u32,
}

impl SingleSiteCoordinator {
    /// Builds the hospital from `config.hospitals[0]` and fills it.
    pub fn new(
        model: AllocationModel,
        config: SimulationConfig,
        demand: impl DemandSource + 'static,
        supply: impl SupplySource + 'static,
    ) -> Result<Self> {
        config.validate().map_err(MatchError::InvalidConfig)?;
        if config.hospitals.len() != 1 || config.dc_capacity.is_some() {
            return Err(MatchError::InvalidConfig(
                "a single-site run takes one hospital and no distribution center".into(),
            ));
        }
        let h = &config.hospitals[0];
        let max_age = model.formulation().max_age;
        let mut site = Location::new(h.name.clone(), LocationKind::Hospital, h.capacity, max_age);
        let mut supply: Box<dyn SupplySource> = Box::new(supply);
        let mut mint = IdMint::new();
        site.fill(supply.as_mut(), &mut mint)?;

        Ok(Self {
            model,
            config,
            site,
            demand: Box::new(demand),
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

    pub fn site(&self) -> &Location {
        &self.site
    }

    pub fn model(&self) -> &AllocationModel {
        &self.model
    }
}

impl EchelonCoordinator for SingleSiteCoordinator {
    fn step(&mut self) -> Result<Vec<DayReport>> {
        let day = self.day;
        let incoming = self.demand.draw(day, &mut self.mint)?;
        let expired = self.site.requests.refresh(day, incoming)?;
        if !expired.is_empty() {
            debug!(day, dropped = expired.len(), "past-due requests dropped");
        }

        let assignment = self
            .model
            .solve(self.site.ledger.units(), self.site.requests.as_slice(), day);
        ensure_solvable(assignment.status, &self.site.name, day)?;

        let mut report = DayReport::new(day, self.site.name.clone(), day < self.config.init_days);
        report.record_assignment(
            &assignment,
            self.site.ledger.units(),
            self.site.requests.as_slice(),
            self.site.ledger.capacity(),
        );
        self.site.record_allocation(&assignment);

        let turnover = self.site.ledger.age_and_expire(&assignment.issued_today())?;
        report.record_turnover(&turnover);
        report.supplied = self.site.restock(self.supply.as_mut(), &mut self.mint, day)?;
        report.inventory_end = self.site.ledger.len();

        debug!(
            day,
            status = %report.status,
            issued = report.units_issued(),
            shortages = report.shortages,
            outdates = report.outdates,
            "day complete"
        );
        self.day += 1;
        Ok(vec![report])
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
        Checkpoint {
            episode: self.episode,
            day: self.day,
            mint: self.mint.clone(),
            locations: vec![self.site.clone()],
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        restore_locations(&mut [&mut self.site], checkpoint.locations)?;
        self.day = checkpoint.day;
        self.mint = checkpoint.mint;
        self.episode = checkpoint.episode;
        Ok(())
    }
}

impl std::fmt::Debug for SingleSiteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleSiteCoordinator")
            .field("episode", &self.episode)
            .field("day", &self.day)
            .field("site", &self.site.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::{Antigen, BloodProfile};
    use crate::config::{HospitalConfig, MatchingConfig};
    use crate::inventory::PatientGroup;
    use crate::report::MemorySink;
    use crate::scenario::{RequestSpec, ScriptedDemand, ScriptedSupply};

    fn sim(capacity: usize, days: u32) -> SimulationConfig {
        SimulationConfig::default()
            .with_days(0, days)
            .with_hospitals(vec![HospitalConfig::new("h", capacity)])
    }

    #[test]
    fn test_rejects_distribution_center() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let config = sim(5, 3).with_dc_capacity(10);
        let r = SingleSiteCoordinator::new(
            model,
            config,
            ScriptedDemand::none(),
            ScriptedSupply::uniform(BloodProfile::all_negative()),
        );
        assert!(matches!(r, Err(MatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_capacity_holds_every_day() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let p = BloodProfile::all_negative();
        let demand = ScriptedDemand::new(
            (0..5)
                .map(|d| RequestSpec::new(p, 2, d, d, PatientGroup::Other))
                .collect(),
        );
        let mut c = SingleSiteCoordinator::new(model, sim(6, 5), demand, ScriptedSupply::uniform(p)).unwrap();
        let mut sink = MemorySink::new();
        c.run(&mut sink).unwrap();
        assert_eq!(sink.reports.len(), 5);
        for r in &sink.reports {
            assert_eq!(r.inventory_end, 6);
            assert_eq!(r.shortages, 0);
            assert_eq!(r.supplied, r.units_issued() + r.outdates);
        }
    }

    #[test]
    fn test_incompatible_stock_shorts_and_restocks() {
        let model = AllocationModel::new(&MatchingConfig::default()).unwrap();
        let k_pos = BloodProfile::from_antigens(&[Antigen::D, Antigen::K]);
        let demand = ScriptedDemand::new(vec![RequestSpec::new(
            BloodProfile::all_negative(),
            1,
            0,
            0,
            PatientGroup::Other,
        )]);
        let mut c = SingleSiteCoordinator::new(model, sim(3, 1), demand, ScriptedSupply::uniform(k_pos)).unwrap();
        let report = c.step().unwrap().remove(0);
        assert_eq!(report.shortages, 1);
        assert_eq!(report.units_issued(), 0);
        assert_eq!(c.day(), 1);
    }
}
