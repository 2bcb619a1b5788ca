//! Per-day, per-location result records.
//!
//! Coordinators emit one [`DayReport`] per location and day into a
//! [`ReportSink`]. Shortages and outdates are recorded here; they are
//! outcomes, never errors.

use crate::blood::{Antigen, MajorGroup, ANTIGEN_COUNT};
use crate::inventory::{InventoryUnit, Request, RequestId, Turnover, UnitId};
use crate::model::{Assignment, ObjectiveBreakdown};
use crate::solver::SolverStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One unit leaving inventory for a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedPair {
    pub unit: UnitId,
    pub request: RequestId,
    pub age: u32,
    pub unit_group: MajorGroup,
    pub request_group: MajorGroup,
}

/// What happened at one location on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayReport {
    pub day: u32,
    pub location: String,
    /// Fill-in day, excluded from summaries.
    pub warm_up: bool,
    pub status: SolverStatus,
    pub pool_size: usize,
    pub elapsed_ms: u64,
    pub requests_due: usize,
    pub units_requested: u32,
    pub issued: Vec<IssuedPair>,
    /// Requests due today that were not served.
    pub shortages: usize,
    pub units_short: u32,
    /// Units requested today beyond what the whole inventory could hold.
    pub unavoidable_shortage: u32,
    pub outdates: usize,
    pub outdates_by_group: [u32; 8],
    /// Units received from supply or shipped in.
    pub supplied: usize,
    /// Units shipped out to other locations.
    pub shipped: usize,
    pub avg_issue_age: f64,
    pub objective: ObjectiveBreakdown,
    /// Requests served today with a mismatch on each antigen.
    pub mismatches: [u32; ANTIGEN_COUNT],
    /// Issued units by unit group (rows) and patient group (columns).
    pub issuing_matrix: [[u32; 8]; 8],
    /// Requests covered by the distribution center today.
    pub dc_covered: Vec<RequestId>,
    pub inventory_end: usize,
}

impl DayReport {
    pub fn new(day: u32, location: impl Into<String>, warm_up: bool) -> Self {
        Self {
            day,
            location: location.into(),
            warm_up,
            status: SolverStatus::Optimal,
            pool_size: 0,
            elapsed_ms: 0,
            requests_due: 0,
            units_requested: 0,
            issued: Vec::new(),
            shortages: 0,
            units_short: 0,
            unavoidable_shortage: 0,
            outdates: 0,
            outdates_by_group: [0; 8],
            supplied: 0,
            shipped: 0,
            avg_issue_age: 0.0,
            objective: ObjectiveBreakdown::default(),
            mismatches: [0; ANTIGEN_COUNT],
            issuing_matrix: [[0; 8]; 8],
            dc_covered: Vec::new(),
            inventory_end: 0,
        }
    }

    /// Records today's part of a hospital solve. `units` and `requests` are
    /// the solve's inputs; `capacity` bounds what could have been issued.
    pub fn record_assignment(
        &mut self,
        assignment: &Assignment,
        units: &[InventoryUnit],
        requests: &[Request],
        capacity: usize,
    ) {
        self.status = assignment.status;
        self.pool_size = assignment.pool_size;
        self.elapsed_ms += assignment.elapsed_ms;
        self.objective = assignment.objective;

        let unit_by_id: HashMap<UnitId, &InventoryUnit> = units.iter().map(|u| (u.id, u)).collect();
        let request_by_id: HashMap<RequestId, &Request> = requests.iter().map(|r| (r.id, r)).collect();

        let mut ages = 0u64;
        for outcome in assignment.outcomes.iter().filter(|o| o.today) {
            let Some(request) = request_by_id.get(&outcome.request) else {
                continue;
            };
            self.requests_due += 1;
            self.units_requested += request.num_units;
            if !outcome.served {
                self.shortages += 1;
                self.units_short += request.num_units;
                continue;
            }
            for a in Antigen::ALL {
                if outcome.mismatch_mask & a.bit() != 0 {
                    self.mismatches[a.index()] += 1;
                }
            }
            let request_group = request.profile.major();
            for (unit, age) in outcome.units.iter().zip(&outcome.issue_ages) {
                let unit_group = unit_by_id
                    .get(unit)
                    .map(|u| u.profile.major())
                    .unwrap_or(request_group);
                self.issuing_matrix[unit_group.index()][request_group.index()] += 1;
                ages += u64::from(*age);
                self.issued.push(IssuedPair {
                    unit: *unit,
                    request: outcome.request,
                    age: *age,
                    unit_group,
                    request_group,
                });
            }
        }
        if !self.issued.is_empty() {
            self.avg_issue_age = ages as f64 / self.issued.len() as f64;
        }
        self.unavoidable_shortage = self.units_requested.saturating_sub(capacity as u32);
    }

    /// Records the end-of-day outdates.
    pub fn record_turnover(&mut self, turnover: &Turnover) {
        self.outdates += turnover.outdated.len();
        for u in &turnover.outdated {
            self.outdates_by_group[u.profile.major().index()] += 1;
        }
    }

    pub fn units_issued(&self) -> usize {
        self.issued.len()
    }
}

/// Receives day reports as they are produced.
pub trait ReportSink {
    fn record(&mut self, report: DayReport);
}

/// Keeps every report in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub reports: Vec<DayReport>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports of one location, in day order.
    pub fn location<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DayReport> + 'a {
        self.reports.iter().filter(move |r| r.location == name)
    }

    pub fn summary(&self) -> EpisodeSummary {
        EpisodeSummary::from_reports(&self.reports)
    }
}

impl ReportSink for MemorySink {
    fn record(&mut self, report: DayReport) {
        self.reports.push(report);
    }
}

/// Aggregates over the evaluated (non-warm-up) days of an episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub days: u32,
    pub units_requested: u64,
    pub units_short: u64,
    pub units_issued: u64,
    pub outdates: u64,
    pub supplied: u64,
    /// Served requests due on their day.
    pub requests_served: u64,
    pub objective: ObjectiveBreakdown,
    /// Solves that ended on a limit or without certification.
    pub degraded_solves: u32,
}

impl EpisodeSummary {
    pub fn from_reports(reports: &[DayReport]) -> Self {
        let mut s = Self::default();
        let mut days = std::collections::BTreeSet::new();
        for r in reports.iter().filter(|r| !r.warm_up) {
            days.insert(r.day);
            s.units_requested += u64::from(r.units_requested);
            s.units_short += u64::from(r.units_short);
            s.units_issued += r.issued.len() as u64;
            s.outdates += r.outdates as u64;
            s.supplied += r.supplied as u64;
            s.requests_served += (r.requests_due - r.shortages) as u64;
            s.objective.add(&r.objective);
            if !r.status.is_optimal() {
                s.degraded_solves += 1;
            }
        }
        s.days = days.len() as u32;
        s
    }

    /// Share of requested units not issued.
    pub fn shortage_rate(&self) -> f64 {
        if self.units_requested == 0 {
            0.0
        } else {
            self.units_short as f64 / self.units_requested as f64
        }
    }

    /// Share of supplied units that outdated.
    pub fn outdate_rate(&self) -> f64 {
        if self.supplied == 0 {
            0.0
        } else {
            self.outdates as f64 / self.supplied as f64
        }
    }

    /// Mismatch penalty per served request.
    pub fn avg_mismatch_penalty(&self) -> f64 {
        if self.requests_served == 0 {
            0.0
        } else {
            self.objective.mismatch / self.requests_served as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::BloodProfile;
    use crate::inventory::PatientGroup;
    use crate::model::RequestOutcome;

    fn request(id: u64, n: u32, issuing: u32) -> Request {
        Request::new(
            RequestId(id),
            BloodProfile::with_group(MajorGroup::APos, &[]),
            n,
            0,
            issuing,
            PatientGroup::Other,
        )
        .unwrap()
    }

    fn assignment(outcomes: Vec<RequestOutcome>) -> Assignment {
        Assignment {
            status: SolverStatus::Optimal,
            outcomes,
            objective: ObjectiveBreakdown {
                shortage: 3.0,
                mismatch: 5.0,
                ..Default::default()
            },
            pool_size: 2,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_assignment_counts_only_today() {
        let units = vec![
            InventoryUnit::new(UnitId(1), BloodProfile::with_group(MajorGroup::ONeg, &[Antigen::K]), 4),
            InventoryUnit::new(UnitId(2), BloodProfile::with_group(MajorGroup::APos, &[]), 2),
        ];
        let requests = vec![request(10, 2, 0), request(11, 3, 0), request(12, 1, 1)];
        let a = assignment(vec![
            RequestOutcome {
                request: RequestId(10),
                served: true,
                units: vec![UnitId(1), UnitId(2)],
                issue_ages: vec![4, 2],
                mismatch_mask: Antigen::K.bit(),
                mismatch_penalty: 5.0,
                today: true,
            },
            RequestOutcome {
                request: RequestId(11),
                served: false,
                units: vec![],
                issue_ages: vec![],
                mismatch_mask: 0,
                mismatch_penalty: 0.0,
                today: true,
            },
            RequestOutcome {
                request: RequestId(12),
                served: false,
                units: vec![],
                issue_ages: vec![],
                mismatch_mask: 0,
                mismatch_penalty: 0.0,
                today: false,
            },
        ]);
        let mut report = DayReport::new(0, "h", false);
        report.record_assignment(&a, &units, &requests, 4);

        assert_eq!(report.requests_due, 2);
        assert_eq!(report.units_requested, 5);
        assert_eq!(report.shortages, 1);
        assert_eq!(report.units_short, 3);
        assert_eq!(report.unavoidable_shortage, 1);
        assert_eq!(report.units_issued(), 2);
        assert_eq!(report.avg_issue_age, 3.0);
        assert_eq!(report.mismatches[Antigen::K.index()], 1);
        assert_eq!(report.issuing_matrix[MajorGroup::ONeg.index()][MajorGroup::APos.index()], 1);
        assert_eq!(report.issuing_matrix[MajorGroup::APos.index()][MajorGroup::APos.index()], 1);
    }

    #[test]
    fn test_turnover_groups_outdates() {
        let mut report = DayReport::new(3, "dc", false);
        let old = InventoryUnit::new(UnitId(9), BloodProfile::with_group(MajorGroup::BNeg, &[]), 34);
        report.record_turnover(&Turnover {
            issued: vec![],
            outdated: vec![old],
        });
        assert_eq!(report.outdates, 1);
        assert_eq!(report.outdates_by_group[MajorGroup::BNeg.index()], 1);
    }

    #[test]
    fn test_summary_skips_warm_up() {
        let mut sink = MemorySink::new();
        let mut warm = DayReport::new(0, "h", true);
        warm.units_requested = 100;
        warm.units_short = 100;
        sink.record(warm);

        let mut day = DayReport::new(1, "h", false);
        day.units_requested = 10;
        day.units_short = 2;
        day.supplied = 8;
        day.outdates = 2;
        day.status = SolverStatus::Timeout;
        sink.record(day);

        let s = sink.summary();
        assert_eq!(s.days, 1);
        assert!((s.shortage_rate() - 0.2).abs() < 1e-12);
        assert!((s.outdate_rate() - 0.25).abs() < 1e-12);
        assert_eq!(s.degraded_solves, 1);
        assert_eq!(sink.location("h").count(), 2);
    }
}
