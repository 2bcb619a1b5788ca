//! Antigen compatibility and shelf-life feasibility.
//!
//! For one solve, [`CompatibilityEngine::matrices`] evaluates every
//! unit/request pair once and stores the results row-major in flat
//! preallocated vectors. Nothing is cached across days: ages and pending
//! requests change daily.

use crate::blood::{Antigen, AntigenPanel};
use crate::config::WeightTable;
use crate::inventory::{InventoryUnit, PatientGroup, Request};

/// Pairwise compatibility rules for a run.
#[derive(Debug, Clone)]
pub struct CompatibilityEngine {
    /// Must-match mask per patient group, restricted to the panel.
    must: [u32; 7],
    /// Minor antigens considered for mismatch accounting.
    soft: u32,
    max_age: u32,
}

impl CompatibilityEngine {
    pub fn new(weights: &WeightTable, panel: &AntigenPanel, max_age: u32) -> Self {
        let mut must = [0; 7];
        for g in PatientGroup::ALL {
            must[g.index()] = weights.must_mask(g, panel);
        }
        Self {
            must,
            soft: panel.minor_mask(),
            max_age,
        }
    }

    /// Antigens `group` must match on.
    #[inline]
    pub fn must_mask(&self, group: PatientGroup) -> u32 {
        self.must[group.index()]
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    /// Whether a unit with phenotype mask `unit` may be given to `request`.
    ///
    /// A unit positive on a must-match antigen the patient lacks is
    /// incompatible. Fyb is the exception: a Fyb-positive unit only
    /// conflicts with a Fyb-negative patient who is Fya-positive.
    pub fn is_compatible(&self, unit: u32, request: &Request) -> bool {
        let req = request.profile.mask();
        let must = self.must_mask(request.group);
        let fyb = Antigen::Fyb.bit();
        if unit & !req & must & !fyb != 0 {
            return false;
        }
        !(must & fyb != 0 && fyb_conflict(unit, req))
    }

    /// Minor antigens on which issuing `unit` to `request` is a mismatch.
    /// Same Fyb rule as [`Self::is_compatible`].
    pub fn mismatch_mask(&self, unit: u32, request: &Request) -> u32 {
        let req = request.profile.mask();
        let fyb = Antigen::Fyb.bit();
        let mut mask = unit & !req & self.soft & !fyb;
        if self.soft & fyb != 0 && fyb_conflict(unit, req) {
            mask |= fyb;
        }
        mask
    }

    /// Whether `unit` is still within shelf life on the request's issuing
    /// day, counting from `day` or from the unit's arrival if later.
    pub fn is_time_feasible(&self, unit: &InventoryUnit, request: &Request, day: u32) -> bool {
        let start = day.max(unit.arrival_day);
        if request.day_issuing < start {
            return false;
        }
        let remaining = i64::from(self.max_age) - 1 - i64::from(unit.age);
        remaining >= i64::from(request.day_issuing - start)
    }

    /// Evaluates both matrices for one solve.
    pub fn matrices(
        &self,
        units: &[InventoryUnit],
        requests: &[Request],
        day: u32,
    ) -> FeasibilityMatrix {
        let n_req = requests.len();
        let mut compatible = vec![false; units.len() * n_req];
        let mut time = vec![false; units.len() * n_req];
        for (i, unit) in units.iter().enumerate() {
            let mask = unit.profile.mask();
            let row = i * n_req;
            for (r, request) in requests.iter().enumerate() {
                compatible[row + r] = self.is_compatible(mask, request);
                time[row + r] = self.is_time_feasible(unit, request, day);
            }
        }
        FeasibilityMatrix {
            n_units: units.len(),
            n_requests: n_req,
            compatible,
            time,
        }
    }
}

#[inline]
fn fyb_conflict(unit: u32, req: u32) -> bool {
    let fya = Antigen::Fya.bit();
    let fyb = Antigen::Fyb.bit();
    unit & fyb != 0 && req & fyb == 0 && req & fya != 0
}

/// `Compatible` and `TimeFeasible` for every unit/request pair of a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct FeasibilityMatrix {
    n_units: usize,
    n_requests: usize,
    compatible: Vec<bool>,
    time: Vec<bool>,
}

impl FeasibilityMatrix {
    pub fn n_units(&self) -> usize {
        self.n_units
    }

    pub fn n_requests(&self) -> usize {
        self.n_requests
    }

    #[inline]
    pub fn compatible(&self, unit: usize, request: usize) -> bool {
        self.compatible[unit * self.n_requests + request]
    }

    #[inline]
    pub fn time_feasible(&self, unit: usize, request: usize) -> bool {
        self.time[unit * self.n_requests + request]
    }

    /// Both conditions hold, so an issue variable exists for the pair.
    #[inline]
    pub fn feasible(&self, unit: usize, request: usize) -> bool {
        let k = unit * self.n_requests + request;
        self.compatible[k] && self.time[k]
    }

    /// Units that may serve `request`, in unit order.
    pub fn candidates(&self, request: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_units).filter(move |&i| self.feasible(i, request))
    }

    /// Number of feasible pairs.
    pub fn feasible_count(&self) -> usize {
        self.compatible
            .iter()
            .zip(&self.time)
            .filter(|(c, t)| **c && **t)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::{BloodProfile, MajorGroup};
    use crate::config::WeightStrategy;
    use crate::inventory::{RequestId, UnitId};

    fn engine() -> CompatibilityEngine {
        let table = WeightStrategy::patient_groups().resolve().unwrap();
        CompatibilityEngine::new(&table, &AntigenPanel::full(), 35)
    }

    fn request(profile: BloodProfile, group: PatientGroup, issuing: u32) -> Request {
        Request::new(RequestId(0), profile, 1, 0, issuing, group).unwrap()
    }

    fn unit(profile: BloodProfile, age: u32) -> InventoryUnit {
        InventoryUnit::new(UnitId(0), profile, age)
    }

    #[test]
    fn test_major_mismatch_is_incompatible() {
        let e = engine();
        let o_neg = request(BloodProfile::all_negative(), PatientGroup::Other, 0);
        let a_pos = BloodProfile::with_group(MajorGroup::APos, &[]);
        assert!(!e.is_compatible(a_pos.mask(), &o_neg));
        let ab_pos = request(BloodProfile::with_group(MajorGroup::AbPos, &[]), PatientGroup::Other, 0);
        assert!(e.is_compatible(BloodProfile::all_negative().mask(), &ab_pos));
        assert!(e.is_compatible(a_pos.mask(), &ab_pos));
    }

    #[test]
    fn test_soft_antigen_is_compatible_but_mismatched() {
        let e = engine();
        let r = request(BloodProfile::all_negative(), PatientGroup::Other, 0);
        let k_pos = BloodProfile::from_antigens(&[Antigen::K]).mask();
        assert!(e.is_compatible(k_pos, &r));
        assert_eq!(e.mismatch_mask(k_pos, &r), Antigen::K.bit());
    }

    #[test]
    fn test_mandatory_minor_for_strict_group() {
        let e = engine();
        let r = request(BloodProfile::all_negative(), PatientGroup::Mds, 0);
        let k_pos = BloodProfile::from_antigens(&[Antigen::K]).mask();
        assert!(!e.is_compatible(k_pos, &r));
        let wu45 = request(BloodProfile::all_negative(), PatientGroup::Wu45, 0);
        assert!(!e.is_compatible(Antigen::E.bit(), &wu45));
        assert!(e.is_compatible(Antigen::C.bit(), &wu45));
    }

    #[test]
    fn test_fyb_exception() {
        let e = engine();
        let fyb_unit = Antigen::Fyb.bit();

        // SCD must match Fya but Fyb is soft: mismatch only when Fya-positive.
        let fya_pos = request(BloodProfile::from_antigens(&[Antigen::Fya]), PatientGroup::Scd, 0);
        assert!(e.is_compatible(fyb_unit, &fya_pos));
        assert_eq!(e.mismatch_mask(fyb_unit, &fya_pos), Antigen::Fyb.bit());

        let fy_null = request(BloodProfile::all_negative(), PatientGroup::Scd, 0);
        assert_eq!(e.mismatch_mask(fyb_unit, &fy_null), 0);

        // With Fyb mandatory, only the Fya-positive patient rejects it.
        let mut strict = WeightStrategy::patient_groups();
        if let WeightStrategy::PatientGroups(rows) = &mut strict {
            rows[PatientGroup::Scd.index()][Antigen::Fyb.index()] = crate::config::Weight::Mandatory;
        }
        let table = strict.resolve().unwrap();
        let e = CompatibilityEngine::new(&table, &AntigenPanel::full(), 35);
        assert!(!e.is_compatible(fyb_unit, &fya_pos));
        assert!(e.is_compatible(fyb_unit, &fy_null));
    }

    #[test]
    fn test_antigens_outside_panel_are_ignored() {
        let table = WeightStrategy::patient_groups().resolve().unwrap();
        let e = CompatibilityEngine::new(&table, &AntigenPanel::major_only(), 35);
        let r = request(BloodProfile::all_negative(), PatientGroup::Mds, 0);
        let k_pos = Antigen::K.bit();
        assert!(e.is_compatible(k_pos, &r));
        assert_eq!(e.mismatch_mask(k_pos, &r), 0);
    }

    #[test]
    fn test_time_feasibility() {
        let e = engine();
        let p = BloodProfile::all_negative();
        let today = request(p, PatientGroup::Other, 10);
        let in_three = request(p, PatientGroup::Other, 13);
        assert!(e.is_time_feasible(&unit(p, 34), &today, 10));
        assert!(!e.is_time_feasible(&unit(p, 34), &in_three, 10));
        assert!(e.is_time_feasible(&unit(p, 31), &in_three, 10));
        assert!(!e.is_time_feasible(&unit(p, 32), &in_three, 10));
        // Past-due requests are never feasible.
        assert!(!e.is_time_feasible(&unit(p, 0), &today, 11));
        // Offline: a unit arriving after the issuing day cannot serve.
        let late = unit(p, 0).with_arrival_day(12);
        assert!(!e.is_time_feasible(&late, &today, 0));
        assert!(e.is_time_feasible(&late, &in_three, 0));
    }

    #[test]
    fn test_matrices_layout() {
        let e = engine();
        let units = vec![
            unit(BloodProfile::all_negative(), 0),
            unit(BloodProfile::with_group(MajorGroup::BPos, &[]), 0),
        ];
        let requests = vec![
            request(BloodProfile::all_negative(), PatientGroup::Other, 0),
            request(BloodProfile::with_group(MajorGroup::BPos, &[]), PatientGroup::Other, 0),
        ];
        let m = e.matrices(&units, &requests, 0);
        assert!(m.feasible(0, 0));
        assert!(m.feasible(0, 1));
        assert!(!m.feasible(1, 0));
        assert!(m.feasible(1, 1));
        assert_eq!(m.candidates(1).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(m.feasible_count(), 3);
    }
}
