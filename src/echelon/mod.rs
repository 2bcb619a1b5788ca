//! Day-by-day simulation over one or more locations.
//!
//! - [`SingleSiteCoordinator`]: one hospital restocked from an external
//!   supply stream.
//! - [`MultiEchelonCoordinator`]: hospitals restocked by a distribution
//!   center, with shortage propagation between them.
//!
//! Days run strictly in sequence. Each coordinator owns its whole object
//! graph, so independent episodes can run side by side.

mod multi;
mod single;
mod transport;

pub use multi::MultiEchelonCoordinator;
pub use single::SingleSiteCoordinator;
pub use transport::{plan_transport, shipping_cost, TransportPlan};

use crate::checkpoint::Checkpoint;
use crate::config::SimulationConfig;
use crate::error::{MatchError, Result};
use crate::inventory::{IdMint, InventoryLedger, InventoryUnit, RequestBook};
use crate::model::Assignment;
use crate::report::{DayReport, ReportSink};
use crate::scenario::SupplySource;
use crate::solver::SolverStatus;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Hospital,
    DistributionCenter,
}

/// A hospital or distribution center: its units and pending requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub kind: LocationKind,
    pub ledger: InventoryLedger,
    pub requests: RequestBook,
}

impl Location {
    pub fn new(name: impl Into<String>, kind: LocationKind, capacity: usize, max_age: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            ledger: InventoryLedger::new(capacity, max_age),
            requests: RequestBook::new(),
        }
    }

    /// Initial fill with ages spread over the shelf life.
    pub fn fill(&mut self, supply: &mut dyn SupplySource, mint: &mut IdMint) -> Result<usize> {
        let ages = InventoryLedger::initial_ages(self.ledger.capacity(), self.ledger.max_age());
        let profiles = supply.draw(0, ages.len())?;
        let units: Vec<_> = profiles
            .into_iter()
            .zip(ages)
            .map(|(p, age)| InventoryUnit::new(mint.unit(), p, age))
            .collect();
        let n = units.len();
        self.ledger.replenish(units)?;
        Ok(n)
    }

    /// Tops the ledger up with fresh units arriving after `day`.
    pub fn restock(&mut self, supply: &mut dyn SupplySource, mint: &mut IdMint, day: u32) -> Result<usize> {
        let n = self.ledger.shortfall();
        if n == 0 {
            return Ok(0);
        }
        let units: Vec<_> = supply
            .draw(day + 1, n)?
            .into_iter()
            .map(|p| InventoryUnit::new(mint.unit(), p, 0).with_arrival_day(day + 1))
            .collect();
        let supplied = units.len();
        self.ledger.replenish(units)?;
        Ok(supplied)
    }

    /// Copies a solve's results onto the pending requests.
    pub fn record_allocation(&mut self, assignment: &Assignment) {
        for outcome in &assignment.outcomes {
            if let Some(r) = self.requests.get_mut(outcome.request) {
                r.units_allocated = outcome.units.len() as u32;
                // An unserved solve keeps the penalty an earlier match set.
                if outcome.served {
                    r.best_mismatch_penalty = Some(outcome.mismatch_penalty);
                }
            }
        }
    }
}

/// Turns an unrecoverable solver status into an error.
///
/// Shortage variables make every well-formed model feasible, so an
/// infeasible or invalid model ends the run.
pub(crate) fn ensure_solvable(status: SolverStatus, location: &str, day: u32) -> Result<()> {
    match status {
        SolverStatus::Infeasible => {
            error!(location, day, "allocation model infeasible");
            Err(MatchError::InfeasibleModel(format!("{location} on day {day}")))
        }
        SolverStatus::ModelInvalid => {
            error!(location, day, "allocation model invalid");
            Err(MatchError::ModelInvalid(format!("{location} on day {day}")))
        }
        _ => Ok(()),
    }
}

/// A simulation advancing one day at a time.
pub trait EchelonCoordinator {
    /// Simulates the current day and returns one report per location.
    fn step(&mut self) -> Result<Vec<DayReport>>;

    /// The next day to simulate.
    fn day(&self) -> u32;

    fn episode(&self) -> u32;

    fn config(&self) -> &SimulationConfig;

    /// Full ledger and request state, resumable with [`restore`](Self::restore).
    fn checkpoint(&self) -> Checkpoint;

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()>;

    /// Runs until the configured horizon, writing periodic checkpoints
    /// when a directory is configured.
    fn run(&mut self, sink: &mut dyn ReportSink) -> Result<()> {
        let horizon = self.config().horizon();
        info!(episode = self.episode(), from = self.day(), horizon, "simulation started");
        while self.day() < horizon {
            for report in self.step()? {
                sink.record(report);
            }
            let every = self.config().checkpoint_every;
            if every > 0 && self.day().is_multiple_of(every) {
                if let Some(dir) = self.config().checkpoint_dir.clone() {
                    self.checkpoint().save(&dir)?;
                }
            }
        }
        info!(episode = self.episode(), horizon, "simulation finished");
        Ok(())
    }
}

/// Replaces `locations` with the checkpointed ones after matching names.
pub(crate) fn restore_locations(
    locations: &mut [&mut Location],
    saved: Vec<Location>,
) -> Result<()> {
    if saved.len() != locations.len() {
        return Err(MatchError::data(format!(
            "checkpoint holds {} locations, simulation has {}",
            saved.len(),
            locations.len()
        )));
    }
    for (current, s) in locations.iter().zip(&saved) {
        if current.name != s.name || current.kind != s.kind {
            return Err(MatchError::data(format!(
                "checkpoint location {} does not match {}",
                s.name, current.name
            )));
        }
    }
    for (current, s) in locations.iter_mut().zip(saved) {
        **current = s;
    }
    Ok(())
}
