//! Transfusion requests and the pending-request book.

use super::unit::RequestId;
use crate::blood::BloodProfile;
use crate::error::{MatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Clinical patient group. Drives mismatch weights, lead times and
/// quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatientGroup {
    Other,
    /// Women under 45, matched on c, E and K.
    Wu45,
    #[serde(rename = "MDS")]
    Mds,
    Thal,
    #[serde(rename = "AIHA")]
    Aiha,
    #[serde(rename = "ALA")]
    Ala,
    #[serde(rename = "SCD")]
    Scd,
}

impl PatientGroup {
    pub const ALL: [PatientGroup; 7] = [
        PatientGroup::Other,
        PatientGroup::Wu45,
        PatientGroup::Mds,
        PatientGroup::Thal,
        PatientGroup::Aiha,
        PatientGroup::Ala,
        PatientGroup::Scd,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Groups that accept minor-antigen substitutions and pay the
    /// substitution term instead of strict matching.
    pub fn is_flexible(self) -> bool {
        matches!(self, PatientGroup::Other | PatientGroup::Wu45)
    }

    /// Chronically transfused groups requiring strict minor-antigen
    /// matching. Their imperfect local matches are retried at the
    /// distribution center.
    pub fn is_strict(self) -> bool {
        !self.is_flexible()
    }

    pub fn label(self) -> &'static str {
        match self {
            PatientGroup::Other => "Other",
            PatientGroup::Wu45 => "Wu45",
            PatientGroup::Mds => "MDS",
            PatientGroup::Thal => "Thal",
            PatientGroup::Aiha => "AIHA",
            PatientGroup::Ala => "ALA",
            PatientGroup::Scd => "SCD",
        }
    }
}

impl fmt::Display for PatientGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A patient's request for `num_units` units, known from `day_available`
/// and to be issued on `day_issuing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub profile: BloodProfile,
    pub num_units: u32,
    pub day_available: u32,
    pub day_issuing: u32,
    pub group: PatientGroup,
    /// Units tentatively allocated by the most recent solve.
    #[serde(default)]
    pub units_allocated: u32,
    /// Lowest mismatch penalty any location has found for this request.
    #[serde(default)]
    pub best_mismatch_penalty: Option<f64>,
    /// Set for the current day when the distribution center covers it.
    #[serde(default)]
    pub allocated_from_dc: bool,
}

impl Request {
    pub fn new(
        id: RequestId,
        profile: BloodProfile,
        num_units: u32,
        day_available: u32,
        day_issuing: u32,
        group: PatientGroup,
    ) -> Result<Self> {
        let request = Self {
            id,
            profile,
            num_units,
            day_available,
            day_issuing,
            group,
            units_allocated: 0,
            best_mismatch_penalty: None,
            allocated_from_dc: false,
        };
        request.validate()?;
        Ok(request)
    }

    /// Checks quantity and day ordering.
    pub fn validate(&self) -> Result<()> {
        if self.num_units == 0 {
            return Err(MatchError::data(format!(
                "request {} asks for zero units",
                self.id
            )));
        }
        if self.day_available > self.day_issuing {
            return Err(MatchError::data(format!(
                "request {} is issued on day {} before it becomes known on day {}",
                self.id, self.day_issuing, self.day_available
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_due(&self, day: u32) -> bool {
        self.day_issuing == day
    }

    /// Days between becoming known and issuing.
    pub fn lead_time(&self) -> u32 {
        self.day_issuing - self.day_available
    }
}

/// Requests pending at one location, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBook {
    requests: Vec<Request>,
}

impl RequestBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts day `day`: drops requests whose issuing day has passed and
    /// admits the newly available ones. Returns the dropped requests.
    pub fn refresh(&mut self, day: u32, incoming: Vec<Request>) -> Result<Vec<Request>> {
        let (kept, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut self.requests)
            .into_iter()
            .partition(|r| r.day_issuing >= day);
        self.requests = kept;
        for r in incoming {
            if r.day_available > day || r.day_issuing < day {
                return Err(MatchError::data(format!(
                    "request {} (days {}..={}) admitted on day {day}",
                    r.id, r.day_available, r.day_issuing
                )));
            }
            self.admit(r)?;
        }
        Ok(expired)
    }

    /// Adds one request after validating it.
    pub fn admit(&mut self, request: Request) -> Result<()> {
        request.validate()?;
        if self.get(request.id).is_some() {
            return Err(MatchError::data(format!(
                "request {} is already pending",
                request.id
            )));
        }
        self.requests.push(request);
        Ok(())
    }

    pub fn as_slice(&self) -> &[Request] {
        &self.requests
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.requests.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// Requests to be issued on `day`.
    pub fn due(&self, day: u32) -> impl Iterator<Item = &Request> {
        self.requests.iter().filter(move |r| r.is_due(day))
    }

    /// Units requested by the requests due on `day`.
    pub fn units_due(&self, day: u32) -> u32 {
        self.due(day).map(|r| r.num_units).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u64, avail: u32, issue: u32) -> Request {
        Request::new(
            RequestId(id),
            BloodProfile::all_negative(),
            2,
            avail,
            issue,
            PatientGroup::Other,
        )
        .unwrap()
    }

    #[test]
    fn test_request_validation() {
        let p = BloodProfile::all_negative();
        assert!(Request::new(RequestId(0), p, 0, 0, 0, PatientGroup::Other).is_err());
        assert!(Request::new(RequestId(0), p, 1, 3, 2, PatientGroup::Other).is_err());
        let r = Request::new(RequestId(0), p, 1, 2, 5, PatientGroup::Mds).unwrap();
        assert_eq!(r.lead_time(), 3);
        assert!(r.is_due(5));
    }

    #[test]
    fn test_group_classes() {
        assert!(PatientGroup::Other.is_flexible());
        assert!(PatientGroup::Wu45.is_flexible());
        for g in [
            PatientGroup::Mds,
            PatientGroup::Thal,
            PatientGroup::Aiha,
            PatientGroup::Ala,
            PatientGroup::Scd,
        ] {
            assert!(g.is_strict());
        }
    }

    #[test]
    fn test_refresh_drops_past_due_and_admits_new() {
        let mut book = RequestBook::new();
        book.refresh(0, vec![req(0, 0, 0), req(1, 0, 2)]).unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book.units_due(0), 2);

        let dropped = book.refresh(1, vec![req(2, 1, 1)]).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, RequestId(0));
        let ids: Vec<_> = book.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2)]);
    }

    #[test]
    fn test_refresh_rejects_stale_or_future_requests() {
        let mut book = RequestBook::new();
        assert!(book.refresh(3, vec![req(0, 1, 2)]).is_err());
        assert!(book.refresh(3, vec![req(1, 4, 5)]).is_err());
    }

    #[test]
    fn test_admit_rejects_duplicates() {
        let mut book = RequestBook::new();
        book.admit(req(0, 0, 1)).unwrap();
        assert!(book.admit(req(0, 0, 1)).is_err());
    }

    #[test]
    fn test_group_serde_labels() {
        let json = serde_json::to_string(&PatientGroup::Aiha).unwrap();
        assert_eq!(json, r#""AIHA""#);
        let g: PatientGroup = serde_json::from_str(r#""Thal""#).unwrap();
        assert_eq!(g, PatientGroup::Thal);
    }
}
