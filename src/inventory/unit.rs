//! Inventory units and identifier minting.

use crate::blood::BloodProfile;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identity of an inventory unit across all locations of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

/// Unique identity of a request across all locations of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Hands out fresh unit and request identifiers.
///
/// One mint is owned by each coordinator so identities stay unique across
/// every location of an episode. It is part of checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMint {
    next_unit: u64,
    next_request: u64,
}

impl IdMint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&mut self) -> UnitId {
        let id = UnitId(self.next_unit);
        self.next_unit += 1;
        id
    }

    pub fn request(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }
}

/// A red-cell unit held in inventory.
///
/// `age` counts days spent in inventory (0 on arrival). `arrival_day` is only
/// consulted by the offline horizon, where units become available over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: UnitId,
    pub profile: BloodProfile,
    pub age: u32,
    #[serde(default)]
    pub arrival_day: u32,
}

impl InventoryUnit {
    pub fn new(id: UnitId, profile: BloodProfile, age: u32) -> Self {
        Self {
            id,
            profile,
            age,
            arrival_day: 0,
        }
    }

    pub fn with_arrival_day(mut self, day: u32) -> Self {
        self.arrival_day = day;
        self
    }
}
