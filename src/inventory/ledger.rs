//! Per-location unit collection and its daily lifecycle.

use super::unit::{InventoryUnit, UnitId};
use crate::error::{MatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Units leaving a ledger at the end of a day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turnover {
    pub issued: Vec<InventoryUnit>,
    pub outdated: Vec<InventoryUnit>,
}

/// The units held by one location.
///
/// Units keep their insertion order. The ledger only moves units in and out;
/// it never clones a unit into a second location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLedger {
    capacity: usize,
    max_age: u32,
    units: Vec<InventoryUnit>,
}

impl InventoryLedger {
    pub fn new(capacity: usize, max_age: u32) -> Self {
        Self {
            capacity,
            max_age,
            units: Vec::with_capacity(capacity),
        }
    }

    /// Ages of the initial fill: `round(capacity / max_age)` units at every
    /// age `0..max_age`, truncated to capacity, then age-0 units up to
    /// capacity.
    pub fn initial_ages(capacity: usize, max_age: u32) -> Vec<u32> {
        let per_age = if max_age == 0 {
            0
        } else {
            (capacity as f64 / max_age as f64).round() as usize
        };
        let mut ages: Vec<u32> = (0..max_age)
            .flat_map(|age| std::iter::repeat_n(age, per_age))
            .take(capacity)
            .collect();
        ages.resize(capacity, 0);
        ages
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    pub fn units(&self) -> &[InventoryUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units missing to reach capacity.
    pub fn shortfall(&self) -> usize {
        self.capacity.saturating_sub(self.units.len())
    }

    pub fn get(&self, id: UnitId) -> Option<&InventoryUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Removes and returns the given units. Every id must be present once.
    pub fn take(&mut self, ids: &[UnitId]) -> Result<Vec<InventoryUnit>> {
        let wanted: HashSet<UnitId> = ids.iter().copied().collect();
        if wanted.len() != ids.len() {
            return Err(MatchError::data("unit taken twice from one ledger"));
        }
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.units)
            .into_iter()
            .partition(|u| wanted.contains(&u.id));
        if taken.len() != ids.len() {
            let missing = ids.len() - taken.len();
            self.units = kept;
            self.units.extend(taken);
            return Err(MatchError::data(format!(
                "{missing} of {} requested units are not in inventory",
                ids.len()
            )));
        }
        self.units = kept;
        Ok(taken)
    }

    /// Ends the day: removes the issued units, discards units that would
    /// reach `max_age`, and ages the rest by one day.
    pub fn age_and_expire(&mut self, issued: &[UnitId]) -> Result<Turnover> {
        let issued = self.take(issued)?;
        let limit = self.max_age.saturating_sub(1);
        let (outdated, mut kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.units)
            .into_iter()
            .partition(|u| u.age >= limit);
        for u in &mut kept {
            u.age += 1;
        }
        self.units = kept;
        Ok(Turnover { issued, outdated })
    }

    /// Adds units, never beyond capacity.
    pub fn replenish(&mut self, units: Vec<InventoryUnit>) -> Result<()> {
        if self.units.len() + units.len() > self.capacity {
            return Err(MatchError::data(format!(
                "replenishing {} units overflows capacity {} (holding {})",
                units.len(),
                self.capacity,
                self.units.len()
            )));
        }
        let mut seen = HashSet::with_capacity(units.len());
        for u in &units {
            if !seen.insert(u.id) {
                return Err(MatchError::data(format!("unit {} supplied twice", u.id)));
            }
            if u.age >= self.max_age {
                return Err(MatchError::data(format!(
                    "unit {} arrives with age {} beyond shelf life {}",
                    u.id, u.age, self.max_age
                )));
            }
            if self.get(u.id).is_some() {
                return Err(MatchError::data(format!("unit {} already in inventory", u.id)));
            }
        }
        self.units.extend(units);
        Ok(())
    }
}
