//! Population phenotype prevalence and the usability score.
//!
//! Usability of a phenotype `x` is the probability that a random patient can
//! receive `x` on the considered antigens. Antigen systems are inherited
//! independently, so it factors as a product over systems of the summed
//! prevalence of every phenotype `p` with `x ⊆ p` on that system.

use super::antigen::AntigenSystem;
use super::profile::BloodProfile;
use crate::error::{MatchError, Result};
use serde::{Deserialize, Serialize};

/// Donor and patient populations with built-in prevalence data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ethnicity {
    Caucasian,
    African,
    Asian,
}

impl Ethnicity {
    pub const ALL: [Ethnicity; 3] = [Ethnicity::Caucasian, Ethnicity::African, Ethnicity::Asian];

    fn column(self) -> usize {
        self as usize
    }
}

/// Phenotype prevalence within one antigen system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrevalence {
    pub system: AntigenSystem,
    /// `(phenotype mask restricted to the system, prevalence)` pairs.
    pub phenotypes: Vec<(u32, f64)>,
}

impl SystemPrevalence {
    /// Sum of prevalences of phenotypes that can receive `mask` on `considered`.
    fn compatible_share(&self, mask: u32, considered: u32) -> f64 {
        let x = mask & considered & self.system.mask();
        let total: f64 = self.phenotypes.iter().map(|(_, p)| p).sum();
        if total <= 0.0 {
            return 1.0;
        }
        let share: f64 = self
            .phenotypes
            .iter()
            .filter(|(p, prev)| *prev > 0.0 && x & !p == 0)
            .map(|(_, prev)| prev)
            .sum();
        share / total
    }
}

/// Prevalence tables for every antigen system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrevalenceTables {
    systems: Vec<SystemPrevalence>,
}

// Genotype rows list the positive/negative state of each antigen of the
// system in `AntigenSystem::antigens` order. Columns: Caucasian, African, Asian.
const ABO: &[([u8; 2], [f64; 3])] = &[
    ([0, 0], [0.43, 0.27, 0.27]),
    ([0, 1], [0.09, 0.49, 0.43]),
    ([1, 0], [0.44, 0.20, 0.25]),
    ([1, 1], [0.04, 0.04, 0.05]),
];

const RH: &[([u8; 5], [f64; 3])] = &[
    ([0, 1, 1, 1, 1], [0.0, 0.0, 0.0]),
    ([0, 1, 0, 1, 0], [0.0, 0.0, 0.0]),
    ([0, 1, 0, 0, 1], [0.0, 0.0, 0.001]),
    ([0, 0, 1, 1, 0], [0.0, 0.0, 0.001]),
    ([0, 0, 1, 0, 1], [0.151, 0.068, 0.001]),
    ([0, 1, 1, 1, 0], [0.0, 0.0, 0.0]),
    ([0, 1, 1, 0, 1], [0.008, 0.0, 0.001]),
    ([0, 1, 0, 1, 1], [0.0, 0.0, 0.0]),
    ([0, 0, 1, 1, 1], [0.009, 0.0, 0.0]),
    ([1, 1, 1, 1, 1], [0.133, 0.056, 0.303]),
    ([1, 1, 0, 1, 0], [0.0, 0.0, 0.0]),
    ([1, 1, 0, 0, 1], [0.185, 0.02, 0.518]),
    ([1, 0, 1, 1, 0], [0.023, 0.002, 0.044]),
    ([1, 0, 1, 0, 1], [0.021, 0.458, 0.003]),
    ([1, 1, 1, 1, 0], [0.001, 0.0, 0.004]),
    ([1, 1, 1, 0, 1], [0.349, 0.21, 0.085]),
    ([1, 1, 0, 1, 1], [0.002, 0.0, 0.014]),
    ([1, 0, 1, 1, 1], [0.118, 0.186, 0.025]),
];

const KELL: &[([u8; 2], [f64; 3])] = &[
    ([0, 0], [0.0, 0.0, 0.0]),
    ([1, 0], [0.002, 0.0, 0.0]),
    ([0, 1], [0.91, 0.98, 1.0]),
    ([1, 1], [0.088, 0.02, 0.0]),
];

const MNS: &[([u8; 4], [f64; 3])] = &[
    ([1, 0, 1, 0], [0.06, 0.02, 0.06]),
    ([1, 0, 1, 1], [0.14, 0.07, 0.14]),
    ([1, 0, 0, 1], [0.08, 0.16, 0.08]),
    ([1, 1, 1, 0], [0.04, 0.02, 0.04]),
    ([1, 1, 1, 1], [0.24, 0.13, 0.24]),
    ([1, 1, 0, 1], [0.22, 0.325, 0.22]),
    ([0, 1, 1, 0], [0.01, 0.02, 0.01]),
    ([0, 1, 1, 1], [0.06, 0.05, 0.06]),
    ([0, 1, 0, 1], [0.15, 0.19, 0.15]),
    ([1, 0, 0, 0], [0.0, 0.004, 0.0]),
    ([1, 1, 0, 0], [0.0, 0.004, 0.0]),
    ([0, 1, 0, 0], [0.0, 0.007, 0.0]),
];

const DUFFY: &[([u8; 2], [f64; 3])] = &[
    ([0, 0], [0.0, 0.68, 0.0]),
    ([1, 0], [0.17, 0.09, 0.908]),
    ([0, 1], [0.34, 0.22, 0.003]),
    ([1, 1], [0.49, 0.01, 0.089]),
];

const KIDD: &[([u8; 2], [f64; 3])] = &[
    ([0, 0], [0.0, 0.0, 0.009]),
    ([1, 0], [0.263, 0.511, 0.232]),
    ([0, 1], [0.234, 0.081, 0.268]),
    ([1, 1], [0.503, 0.488, 0.491]),
];

fn rows_to_system<const N: usize>(
    system: AntigenSystem,
    rows: &[([u8; N], [f64; 3])],
    weights: &[(Ethnicity, f64)],
) -> SystemPrevalence {
    let antigens = system.antigens();
    let phenotypes = rows
        .iter()
        .map(|(bits, prev)| {
            let mask = bits
                .iter()
                .zip(antigens)
                .filter(|(b, _)| **b == 1)
                .fold(0u32, |m, (_, a)| m | a.bit());
            let p: f64 = weights.iter().map(|(e, w)| w * prev[e.column()]).sum();
            (mask, p)
        })
        .collect();
    SystemPrevalence { system, phenotypes }
}

impl PrevalenceTables {
    /// Built-in tables for a single population.
    pub fn for_ethnicity(ethnicity: Ethnicity) -> Self {
        Self::build(&[(ethnicity, 1.0)])
    }

    /// Built-in tables mixed by population weights (normalized internally).
    pub fn mixed(weights: &[(Ethnicity, f64)]) -> Result<Self> {
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if weights.iter().any(|(_, w)| *w < 0.0) || total <= 0.0 {
            return Err(MatchError::InvalidConfig(
                "ethnicity weights must be non-negative with a positive sum".into(),
            ));
        }
        let normalized: Vec<_> = weights.iter().map(|(e, w)| (*e, w / total)).collect();
        Ok(Self::build(&normalized))
    }

    /// Custom tables, one entry per antigen system.
    pub fn from_systems(systems: Vec<SystemPrevalence>) -> Result<Self> {
        for s in &systems {
            if s.phenotypes.iter().any(|(m, p)| *p < 0.0 || m & !s.system.mask() != 0) {
                return Err(MatchError::InvalidConfig(format!(
                    "{:?} prevalence table has a negative entry or a foreign antigen",
                    s.system
                )));
            }
        }
        Ok(Self { systems })
    }

    fn build(weights: &[(Ethnicity, f64)]) -> Self {
        Self {
            systems: vec![
                rows_to_system(AntigenSystem::Abo, ABO, weights),
                rows_to_system(AntigenSystem::Rh, RH, weights),
                rows_to_system(AntigenSystem::Kell, KELL, weights),
                rows_to_system(AntigenSystem::Mns, MNS, weights),
                rows_to_system(AntigenSystem::Duffy, DUFFY, weights),
                rows_to_system(AntigenSystem::Kidd, KIDD, weights),
            ],
        }
    }

    pub fn systems(&self) -> &[SystemPrevalence] {
        &self.systems
    }

    /// Probability that a random patient can receive `profile`, matching
    /// only on the antigens in `considered`.
    pub fn usability(&self, profile: &BloodProfile, considered: u32) -> f64 {
        self.systems
            .iter()
            .map(|s| s.compatible_share(profile.mask(), considered))
            .product()
    }

    /// Prevalence of `profile` itself within one system.
    pub fn frequency(&self, profile: &BloodProfile, system: AntigenSystem) -> f64 {
        let Some(s) = self.systems.iter().find(|s| s.system == system) else {
            return 0.0;
        };
        let x = profile.mask() & system.mask();
        s.phenotypes
            .iter()
            .filter(|(p, _)| *p == x)
            .map(|(_, prev)| prev)
            .sum()
    }
}

impl Default for PrevalenceTables {
    fn default() -> Self {
        Self::for_ethnicity(Ethnicity::Caucasian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blood::antigen::{Antigen, FULL_MASK, MAJOR_MASK};
    use crate::blood::profile::MajorGroup;

    #[test]
    fn test_all_negative_is_universally_usable() {
        let t = PrevalenceTables::default();
        let u = t.usability(&BloodProfile::all_negative(), FULL_MASK);
        assert!((u - 1.0).abs() < 1e-9, "got {u}");
    }

    #[test]
    fn test_ab_pos_usability_is_ab_d_share() {
        let t = PrevalenceTables::for_ethnicity(Ethnicity::Caucasian);
        let p = BloodProfile::with_group(MajorGroup::AbPos, &[]);
        let u = t.usability(&p, MAJOR_MASK);
        // AB share 0.04 times D-positive share (0.832 of the Rh total)
        let rh_total: f64 = RH.iter().map(|(_, c)| c[0]).sum();
        let d_pos: f64 = RH.iter().filter(|(b, _)| b[0] == 1).map(|(_, c)| c[0]).sum();
        assert!((u - 0.04 * d_pos / rh_total).abs() < 1e-9, "got {u}");
    }

    #[test]
    fn test_ignored_antigens_do_not_reduce_usability() {
        let t = PrevalenceTables::default();
        let k_pos = BloodProfile::from_antigens(&[Antigen::K]);
        assert!((t.usability(&k_pos, MAJOR_MASK) - 1.0).abs() < 1e-9);
        assert!(t.usability(&k_pos, FULL_MASK) < 0.1);
    }

    #[test]
    fn test_usability_monotone_in_positivity() {
        let t = PrevalenceTables::default();
        let fewer = BloodProfile::from_antigens(&[Antigen::D]);
        let more = BloodProfile::from_antigens(&[Antigen::D, Antigen::C, Antigen::Fya]);
        assert!(t.usability(&more, FULL_MASK) <= t.usability(&fewer, FULL_MASK));
    }

    #[test]
    fn test_mixed_matches_single_when_weight_is_one() {
        let a = PrevalenceTables::mixed(&[(Ethnicity::African, 3.0)]).unwrap();
        let b = PrevalenceTables::for_ethnicity(Ethnicity::African);
        assert_eq!(a, b);
        assert!(PrevalenceTables::mixed(&[(Ethnicity::Asian, 0.0)]).is_err());
    }

    #[test]
    fn test_frequency_lookup() {
        let t = PrevalenceTables::for_ethnicity(Ethnicity::African);
        let duffy_null = BloodProfile::all_negative();
        assert!((t.frequency(&duffy_null, AntigenSystem::Duffy) - 0.68).abs() < 1e-12);
    }

    #[test]
    fn test_custom_tables_reject_foreign_antigens() {
        let bad = SystemPrevalence {
            system: AntigenSystem::Kell,
            phenotypes: vec![(Antigen::A.bit(), 1.0)],
        };
        assert!(PrevalenceTables::from_systems(vec![bad]).is_err());
    }
}
