//! Antigen catalogue and run-time antigen panel.

use serde::{Deserialize, Serialize};

/// Number of antigens tracked per phenotype.
pub const ANTIGEN_COUNT: usize = 17;

/// Bit mask covering every tracked antigen.
pub const FULL_MASK: u32 = (1 << ANTIGEN_COUNT) - 1;

/// Bit mask of the major (ABO/RhD) antigens.
pub const MAJOR_MASK: u32 = 0b111;

/// A red-cell surface antigen.
///
/// The discriminant is the antigen's position in every phenotype vector:
/// A, B, D, C, c, E, e, K, k, M, N, S, s, Fya, Fyb, Jka, Jkb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Antigen {
    A = 0,
    B = 1,
    D = 2,
    C = 3,
    #[serde(rename = "c")]
    LowerC = 4,
    E = 5,
    #[serde(rename = "e")]
    LowerE = 6,
    K = 7,
    #[serde(rename = "k")]
    LowerK = 8,
    M = 9,
    N = 10,
    S = 11,
    #[serde(rename = "s")]
    LowerS = 12,
    Fya = 13,
    Fyb = 14,
    Jka = 15,
    Jkb = 16,
}

impl Antigen {
    /// All antigens in vector order.
    pub const ALL: [Antigen; ANTIGEN_COUNT] = [
        Antigen::A,
        Antigen::B,
        Antigen::D,
        Antigen::C,
        Antigen::LowerC,
        Antigen::E,
        Antigen::LowerE,
        Antigen::K,
        Antigen::LowerK,
        Antigen::M,
        Antigen::N,
        Antigen::S,
        Antigen::LowerS,
        Antigen::Fya,
        Antigen::Fyb,
        Antigen::Jka,
        Antigen::Jkb,
    ];

    /// The minor antigens in vector order.
    pub const MINOR: [Antigen; ANTIGEN_COUNT - 3] = [
        Antigen::C,
        Antigen::LowerC,
        Antigen::E,
        Antigen::LowerE,
        Antigen::K,
        Antigen::LowerK,
        Antigen::M,
        Antigen::N,
        Antigen::S,
        Antigen::LowerS,
        Antigen::Fya,
        Antigen::Fyb,
        Antigen::Jka,
        Antigen::Jkb,
    ];

    /// Position in the phenotype vector.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Single-bit mask for this antigen.
    #[inline]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Whether this antigen determines the ABO/RhD group.
    #[inline]
    pub fn is_major(self) -> bool {
        self.bit() & MAJOR_MASK != 0
    }

    /// Looks up an antigen by index.
    pub fn from_index(index: usize) -> Option<Antigen> {
        Antigen::ALL.get(index).copied()
    }

    /// Conventional serological name.
    pub fn name(self) -> &'static str {
        match self {
            Antigen::A => "A",
            Antigen::B => "B",
            Antigen::D => "D",
            Antigen::C => "C",
            Antigen::LowerC => "c",
            Antigen::E => "E",
            Antigen::LowerE => "e",
            Antigen::K => "K",
            Antigen::LowerK => "k",
            Antigen::M => "M",
            Antigen::N => "N",
            Antigen::S => "S",
            Antigen::LowerS => "s",
            Antigen::Fya => "Fya",
            Antigen::Fyb => "Fyb",
            Antigen::Jka => "Jka",
            Antigen::Jkb => "Jkb",
        }
    }

    /// Parses a serological name (case-sensitive: `c` and `C` differ).
    pub fn from_name(name: &str) -> Option<Antigen> {
        Antigen::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// The blood-group system this antigen belongs to.
    pub fn system(self) -> AntigenSystem {
        match self {
            Antigen::A | Antigen::B => AntigenSystem::Abo,
            Antigen::D | Antigen::C | Antigen::LowerC | Antigen::E | Antigen::LowerE => {
                AntigenSystem::Rh
            }
            Antigen::K | Antigen::LowerK => AntigenSystem::Kell,
            Antigen::M | Antigen::N | Antigen::S | Antigen::LowerS => AntigenSystem::Mns,
            Antigen::Fya | Antigen::Fyb => AntigenSystem::Duffy,
            Antigen::Jka | Antigen::Jkb => AntigenSystem::Kidd,
        }
    }
}

impl std::fmt::Display for Antigen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Independent antigen systems used for usability and phenotype sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AntigenSystem {
    Abo,
    Rh,
    Kell,
    Mns,
    Duffy,
    Kidd,
}

impl AntigenSystem {
    pub const ALL: [AntigenSystem; 6] = [
        AntigenSystem::Abo,
        AntigenSystem::Rh,
        AntigenSystem::Kell,
        AntigenSystem::Mns,
        AntigenSystem::Duffy,
        AntigenSystem::Kidd,
    ];

    /// Antigens of this system, in the column order of the prevalence tables.
    pub fn antigens(self) -> &'static [Antigen] {
        match self {
            AntigenSystem::Abo => &[Antigen::A, Antigen::B],
            AntigenSystem::Rh => &[
                Antigen::D,
                Antigen::C,
                Antigen::LowerC,
                Antigen::E,
                Antigen::LowerE,
            ],
            AntigenSystem::Kell => &[Antigen::K, Antigen::LowerK],
            AntigenSystem::Mns => &[Antigen::M, Antigen::N, Antigen::S, Antigen::LowerS],
            AntigenSystem::Duffy => &[Antigen::Fya, Antigen::Fyb],
            AntigenSystem::Kidd => &[Antigen::Jka, Antigen::Jkb],
        }
    }

    /// Bit mask of the system's antigens.
    pub fn mask(self) -> u32 {
        self.antigens().iter().fold(0, |m, a| m | a.bit())
    }
}

/// The set of antigens matched on during a run.
///
/// Major antigens are always part of the panel; the minor antigens are
/// chosen per run configuration. Antigens outside the panel are carried in
/// every phenotype but ignored by compatibility and mismatch accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Antigen>", into = "Vec<Antigen>")]
pub struct AntigenPanel {
    mask: u32,
}

impl AntigenPanel {
    /// Panel with the given minor antigens (major antigens are implied).
    pub fn new(minor: &[Antigen]) -> Self {
        let mask = minor.iter().fold(MAJOR_MASK, |m, a| m | a.bit());
        Self { mask }
    }

    /// Only A, B and D.
    pub fn major_only() -> Self {
        Self { mask: MAJOR_MASK }
    }

    /// Every tracked antigen.
    pub fn full() -> Self {
        Self { mask: FULL_MASK }
    }

    #[inline]
    pub fn contains(&self, antigen: Antigen) -> bool {
        self.mask & antigen.bit() != 0
    }

    /// Mask of all antigens in the panel.
    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Mask of the minor antigens in the panel.
    #[inline]
    pub fn minor_mask(&self) -> u32 {
        self.mask & !MAJOR_MASK
    }

    /// Minor antigens in the panel, in vector order.
    pub fn minor(&self) -> impl Iterator<Item = Antigen> + '_ {
        Antigen::MINOR.iter().copied().filter(|a| self.contains(*a))
    }
}

impl Default for AntigenPanel {
    fn default() -> Self {
        Self::full()
    }
}

impl From<Vec<Antigen>> for AntigenPanel {
    fn from(antigens: Vec<Antigen>) -> Self {
        Self::new(&antigens)
    }
}

impl From<AntigenPanel> for Vec<Antigen> {
    fn from(panel: AntigenPanel) -> Self {
        panel.minor().collect()
    }
}
