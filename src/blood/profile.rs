//! Immutable antigen phenotypes and the derived ABO/RhD group.

use super::antigen::{Antigen, ANTIGEN_COUNT, FULL_MASK};
use crate::error::{MatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ABO/RhD group derived from the A, B and D antigens.
///
/// Discriminants give the conventional reporting order
/// O-, O+, A-, A+, B-, B+, AB-, AB+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MajorGroup {
    #[serde(rename = "O-")]
    ONeg = 0,
    #[serde(rename = "O+")]
    OPos = 1,
    #[serde(rename = "A-")]
    ANeg = 2,
    #[serde(rename = "A+")]
    APos = 3,
    #[serde(rename = "B-")]
    BNeg = 4,
    #[serde(rename = "B+")]
    BPos = 5,
    #[serde(rename = "AB-")]
    AbNeg = 6,
    #[serde(rename = "AB+")]
    AbPos = 7,
}

impl MajorGroup {
    pub const ALL: [MajorGroup; 8] = [
        MajorGroup::ONeg,
        MajorGroup::OPos,
        MajorGroup::ANeg,
        MajorGroup::APos,
        MajorGroup::BNeg,
        MajorGroup::BPos,
        MajorGroup::AbNeg,
        MajorGroup::AbPos,
    ];

    /// Derives the group from the low three bits (A, B, D) of a phenotype mask.
    pub fn from_mask(mask: u32) -> Self {
        let a = mask & Antigen::A.bit() != 0;
        let b = mask & Antigen::B.bit() != 0;
        let d = mask & Antigen::D.bit() != 0;
        Self::ALL[(usize::from(a) << 1 | usize::from(b) << 2) + usize::from(d)]
    }

    /// Position in reporting order.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The A, B and D bits carried by this group.
    pub fn mask(self) -> u32 {
        let i = self as u32;
        let d = i & 1;
        let a = (i >> 1) & 1;
        let b = (i >> 2) & 1;
        a * Antigen::A.bit() | b * Antigen::B.bit() | d * Antigen::D.bit()
    }

    pub fn label(self) -> &'static str {
        match self {
            MajorGroup::ONeg => "O-",
            MajorGroup::OPos => "O+",
            MajorGroup::ANeg => "A-",
            MajorGroup::APos => "A+",
            MajorGroup::BNeg => "B-",
            MajorGroup::BPos => "B+",
            MajorGroup::AbNeg => "AB-",
            MajorGroup::AbPos => "AB+",
        }
    }
}

impl fmt::Display for MajorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MajorGroup {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self> {
        MajorGroup::ALL
            .iter()
            .copied()
            .find(|g| g.label() == s)
            .ok_or_else(|| MatchError::data(format!("unknown blood group {s:?}")))
    }
}

/// A red-cell phenotype over the 17 tracked antigens.
///
/// Stored as a bit mask (bit `k` set means antigen-positive on
/// [`Antigen::from_index(k)`]) with the major group cached at construction.
/// Profiles never change once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BloodProfile {
    mask: u32,
    major: MajorGroup,
}

impl BloodProfile {
    /// Builds a profile from a raw mask, rejecting bits beyond the panel.
    pub fn from_mask(mask: u32) -> Result<Self> {
        if mask & !FULL_MASK != 0 {
            return Err(MatchError::data(format!(
                "phenotype mask {mask:#x} sets bits beyond {ANTIGEN_COUNT} antigens"
            )));
        }
        Ok(Self {
            mask,
            major: MajorGroup::from_mask(mask),
        })
    }

    /// Builds a profile that is positive exactly on `antigens`.
    pub fn from_antigens(antigens: &[Antigen]) -> Self {
        let mask = antigens.iter().fold(0, |m, a| m | a.bit());
        Self {
            mask,
            major: MajorGroup::from_mask(mask),
        }
    }

    /// Builds a profile from a group plus the positive minor antigens.
    pub fn with_group(group: MajorGroup, minor: &[Antigen]) -> Self {
        let mask = minor
            .iter()
            .filter(|a| !a.is_major())
            .fold(group.mask(), |m, a| m | a.bit());
        Self { mask, major: group }
    }

    /// Builds a profile from a 0/1 vector in antigen order.
    pub fn from_vector(values: &[u8]) -> Result<Self> {
        if values.len() != ANTIGEN_COUNT {
            return Err(MatchError::data(format!(
                "phenotype vector has {} entries, expected {ANTIGEN_COUNT}",
                values.len()
            )));
        }
        let mut mask = 0;
        for (k, &v) in values.iter().enumerate() {
            match v {
                0 => {}
                1 => mask |= 1 << k,
                other => {
                    return Err(MatchError::data(format!(
                        "phenotype entry {k} is {other}, expected 0 or 1"
                    )))
                }
            }
        }
        Self::from_mask(mask)
    }

    /// The all-negative phenotype (O-, negative on every minor antigen).
    pub fn all_negative() -> Self {
        Self {
            mask: 0,
            major: MajorGroup::ONeg,
        }
    }

    #[inline]
    pub fn has(&self, antigen: Antigen) -> bool {
        self.mask & antigen.bit() != 0
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    pub fn major(&self) -> MajorGroup {
        self.major
    }

    /// 0/1 vector in antigen order.
    pub fn to_vector(&self) -> [u8; ANTIGEN_COUNT] {
        let mut out = [0u8; ANTIGEN_COUNT];
        for (k, slot) in out.iter_mut().enumerate() {
            *slot = ((self.mask >> k) & 1) as u8;
        }
        out
    }
}

impl TryFrom<u32> for BloodProfile {
    type Error = MatchError;

    fn try_from(mask: u32) -> Result<Self> {
        Self::from_mask(mask)
    }
}

impl From<BloodProfile> for u32 {
    fn from(profile: BloodProfile) -> Self {
        profile.mask
    }
}

impl fmt::Display for BloodProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        for a in Antigen::MINOR {
            let sign = if self.has(a) { '+' } else { '-' };
            write!(f, " {a}{sign}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_group_derivation() {
        assert_eq!(BloodProfile::all_negative().major(), MajorGroup::ONeg);
        let a_pos = BloodProfile::from_antigens(&[Antigen::A, Antigen::D]);
        assert_eq!(a_pos.major(), MajorGroup::APos);
        let b_neg = BloodProfile::from_antigens(&[Antigen::B, Antigen::K]);
        assert_eq!(b_neg.major(), MajorGroup::BNeg);
        let ab_pos = BloodProfile::from_antigens(&[Antigen::A, Antigen::B, Antigen::D]);
        assert_eq!(ab_pos.major(), MajorGroup::AbPos);
    }

    #[test]
    fn test_group_mask_round_trip() {
        for g in MajorGroup::ALL {
            assert_eq!(MajorGroup::from_mask(g.mask()), g);
            assert_eq!(g.label().parse::<MajorGroup>().unwrap(), g);
        }
    }

    #[test]
    fn test_with_group_ignores_major_in_minor_list() {
        let p = BloodProfile::with_group(MajorGroup::ONeg, &[Antigen::D, Antigen::Fya]);
        assert_eq!(p.major(), MajorGroup::ONeg);
        assert!(!p.has(Antigen::D));
        assert!(p.has(Antigen::Fya));
    }

    #[test]
    fn test_from_vector_rejects_bad_length() {
        assert!(BloodProfile::from_vector(&[0; 16]).is_err());
        assert!(BloodProfile::from_vector(&[0; 18]).is_err());
    }

    #[test]
    fn test_from_vector_rejects_non_binary() {
        let mut v = [0u8; ANTIGEN_COUNT];
        v[4] = 2;
        let err = BloodProfile::from_vector(&v).unwrap_err();
        assert!(matches!(err, MatchError::DataInconsistency(_)));
    }

    #[test]
    fn test_vector_round_trip() {
        let p = BloodProfile::from_antigens(&[Antigen::A, Antigen::LowerC, Antigen::Jkb]);
        let v = p.to_vector();
        assert_eq!(v[0], 1);
        assert_eq!(v[4], 1);
        assert_eq!(v[16], 1);
        assert_eq!(BloodProfile::from_vector(&v).unwrap(), p);
    }

    #[test]
    fn test_from_mask_rejects_high_bits() {
        assert!(BloodProfile::from_mask(1 << 17).is_err());
        assert!(BloodProfile::from_mask(FULL_MASK).is_ok());
    }

    #[test]
    fn test_serde_as_mask() {
        let p = BloodProfile::from_antigens(&[Antigen::D, Antigen::K]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, (Antigen::D.bit() | Antigen::K.bit()).to_string());
        let back: BloodProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<BloodProfile>("262144").is_err());
    }
}
