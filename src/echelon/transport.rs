//! Restocking hospitals from the distribution center.
//!
//! Shipping cost does not depend on the destination, so ranking the
//! center's units by cost and handing out the cheapest ones solves the
//! transportation problem exactly.

use crate::inventory::{InventoryUnit, UnitId};
use crate::model::Formulation;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Units leaving the distribution center, per hospital.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportPlan {
    pub shipments: Vec<Vec<UnitId>>,
    /// Committed units that did not fit a hospital's shortfall and stay at
    /// the center.
    pub held_back: usize,
}

impl TransportPlan {
    pub fn shipped(&self) -> usize {
        self.shipments.iter().map(Vec::len).sum()
    }

    /// Every shipped unit with its destination.
    pub fn destinations(&self) -> impl Iterator<Item = (UnitId, usize)> + '_ {
        self.shipments
            .iter()
            .enumerate()
            .flat_map(|(h, units)| units.iter().map(move |u| (*u, h)))
    }
}

/// Cost of shipping a unit: older and rarer units go out first.
pub fn shipping_cost(f: &Formulation, unit: &InventoryUnit) -> f64 {
    f.freshness.penalty(unit.age, f.max_age) + f.usability(&unit.profile)
}

/// Ships each hospital exactly its shortfall when stock allows.
///
/// `forced` lists units already committed to a hospital's requests; they
/// are shipped first. A hospital never receives more than its shortfall,
/// so committed units past it stay at the center and are counted in
/// [`TransportPlan::held_back`]. The request they were committed to stays
/// marked as covered by the center and is solved again locally on its
/// issuing day. The rest of each shortfall is filled with the cheapest
/// remaining units.
pub fn plan_transport(
    f: &Formulation,
    units: &[InventoryUnit],
    forced: &[(usize, UnitId)],
    shortfalls: &[usize],
) -> TransportPlan {
    let mut plan = TransportPlan {
        shipments: vec![Vec::new(); shortfalls.len()],
        held_back: 0,
    };
    let mut used = HashSet::new();

    for &(h, id) in forced {
        if h < shortfalls.len() && plan.shipments[h].len() < shortfalls[h] && used.insert(id) {
            plan.shipments[h].push(id);
        } else {
            plan.held_back += 1;
        }
    }

    let mut ranked: Vec<(f64, &InventoryUnit)> = units
        .iter()
        .filter(|u| !used.contains(&u.id))
        .map(|u| (shipping_cost(f, u), u))
        .collect();
    ranked.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.id.cmp(&b.1.id))
    });

    let mut next = ranked.into_iter();
    for (h, &need) in shortfalls.iter().enumerate() {
        while plan.shipments[h].len() < need {
            let Some((_, unit)) = next.next() else {
                break;
            };
            plan.shipments[h].push(unit.id);
        }
    }

    debug!(
        shipped = plan.shipped(),
        needed = shortfalls.iter().sum::<usize>(),
        held_back = plan.held_back,
        "transport planned"
    );
    plan
}
