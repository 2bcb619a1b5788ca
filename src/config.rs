//! Run configuration: matching policy, weight strategies and simulation
//! topology.
//!
//! Configurations are plain data with builder methods and `validate()`.
//! They are loaded once per run (optionally from JSON) and resolved into
//! immutable lookup tables before the first solve.

use crate::blood::{Antigen, AntigenPanel, Ethnicity, PrevalenceTables, ANTIGEN_COUNT};
use crate::error::{MatchError, Result};
use crate::inventory::PatientGroup;
use crate::solver::SolverConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// Mismatch weight of one antigen for one patient group.
///
/// Serialized as a number, with `-1` standing for [`Weight::Mandatory`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum Weight {
    /// Must match: a unit positive where the patient is negative is
    /// incompatible.
    Mandatory,
    /// Penalty per mismatched request.
    Soft(f64),
}

impl Weight {
    /// Penalty contribution; mandatory antigens never mismatch on a
    /// compatible pair, so they contribute nothing.
    #[inline]
    pub fn soft(self) -> f64 {
        match self {
            Weight::Mandatory => 0.0,
            Weight::Soft(w) => w,
        }
    }

    #[inline]
    pub fn is_mandatory(self) -> bool {
        matches!(self, Weight::Mandatory)
    }
}

impl TryFrom<f64> for Weight {
    type Error = MatchError;

    fn try_from(v: f64) -> Result<Self> {
        if v == -1.0 {
            Ok(Weight::Mandatory)
        } else if v >= 0.0 && v.is_finite() {
            Ok(Weight::Soft(v))
        } else {
            Err(MatchError::InvalidConfig(format!(
                "mismatch weight {v} is neither -1 (mandatory) nor a finite non-negative number"
            )))
        }
    }
}

impl From<Weight> for f64 {
    fn from(w: Weight) -> Self {
        match w {
            Weight::Mandatory => -1.0,
            Weight::Soft(v) => v,
        }
    }
}

const M: Weight = Weight::Mandatory;

const fn s(v: f64) -> Weight {
    Weight::Soft(v)
}

/// Relative immunogenicity of each antigen, shared by all patient groups.
pub const RELATIVE_IMMUNOGENICITY: [Weight; ANTIGEN_COUNT] = [
    M,
    M,
    M,
    s(0.0345),
    s(0.0705),
    s(0.2395),
    s(0.0836),
    s(0.3838),
    s(0.0),
    s(0.0296),
    s(0.0),
    s(0.0131),
    s(0.0),
    s(0.0443),
    s(0.0131),
    s(0.0836),
    s(0.0033),
];

/// Mismatch weights per patient group, rows in [`PatientGroup::ALL`] order.
pub const PATIENT_GROUP_WEIGHTS: [[Weight; ANTIGEN_COUNT]; 7] = [
    // Other
    [
        M,
        M,
        M,
        s(0.02651),
        s(0.05429),
        s(0.18433),
        s(0.06439),
        s(0.29543),
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.00337),
        s(0.00128),
        s(0.02273),
        s(0.00673),
        s(0.04293),
        s(0.00168),
    ],
    // Wu45
    [
        M,
        M,
        M,
        s(0.02651),
        M,
        M,
        s(0.06439),
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.00337),
        s(0.00128),
        s(0.02273),
        s(0.00673),
        s(0.04293),
        s(0.00168),
    ],
    // MDS
    [
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.10100),
        s(0.03844),
        s(0.68177),
        s(0.20200),
        s(1.28778),
        s(0.05050),
    ],
    // Thal
    [
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.10100),
        s(0.03844),
        s(0.68177),
        s(0.20200),
        s(1.28778),
        s(0.05050),
    ],
    // AIHA
    [
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.20200),
        s(0.07689),
        s(1.3653),
        s(0.40401),
        s(2.57556),
        s(0.10100),
    ],
    // ALA
    [
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.20200),
        s(0.07689),
        s(1.3653),
        s(0.40401),
        s(2.57556),
        s(0.10100),
    ],
    // SCD
    [
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        M,
        s(0.0),
        s(0.0),
        s(0.0),
        s(0.33667),
        s(0.12815),
        M,
        s(0.67335),
        M,
        M,
    ],
];

/// How mismatch weights are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "weights", rename_all = "snake_case")]
pub enum WeightStrategy {
    /// Only A, B and D matter; minor antigens carry no weight.
    MajorOnly,
    /// One weight row used for every patient group.
    RelativeImmunogenicity(Vec<Weight>),
    /// One weight row per patient group, in [`PatientGroup::ALL`] order.
    PatientGroups(Vec<Vec<Weight>>),
}

impl WeightStrategy {
    /// Built-in relative immunogenicity row.
    pub fn relative_immunogenicity() -> Self {
        WeightStrategy::RelativeImmunogenicity(RELATIVE_IMMUNOGENICITY.to_vec())
    }

    /// Built-in per-group table.
    pub fn patient_groups() -> Self {
        WeightStrategy::PatientGroups(PATIENT_GROUP_WEIGHTS.iter().map(|r| r.to_vec()).collect())
    }

    /// Resolves the strategy into a lookup table. Major antigens are forced
    /// to [`Weight::Mandatory`].
    pub fn resolve(&self) -> Result<WeightTable> {
        let mut rows = [[Weight::Soft(0.0); ANTIGEN_COUNT]; 7];
        match self {
            WeightStrategy::MajorOnly => {}
            WeightStrategy::RelativeImmunogenicity(row) => {
                let row = fixed_row(row)?;
                rows.iter_mut().for_each(|r| *r = row);
            }
            WeightStrategy::PatientGroups(table) => {
                if table.len() != PatientGroup::ALL.len() {
                    return Err(MatchError::InvalidConfig(format!(
                        "patient-group weight table has {} rows, expected {}",
                        table.len(),
                        PatientGroup::ALL.len()
                    )));
                }
                for (dst, src) in rows.iter_mut().zip(table) {
                    *dst = fixed_row(src)?;
                }
            }
        }
        for row in &mut rows {
            for a in [Antigen::A, Antigen::B, Antigen::D] {
                row[a.index()] = Weight::Mandatory;
            }
        }
        Ok(WeightTable { rows })
    }
}

fn fixed_row(row: &[Weight]) -> Result<[Weight; ANTIGEN_COUNT]> {
    <[Weight; ANTIGEN_COUNT]>::try_from(row).map_err(|_| {
        MatchError::InvalidConfig(format!(
            "weight row has {} entries, expected {ANTIGEN_COUNT}",
            row.len()
        ))
    })
}

impl Default for WeightStrategy {
    fn default() -> Self {
        Self::patient_groups()
    }
}

/// Resolved, immutable mismatch weights.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    rows: [[Weight; ANTIGEN_COUNT]; 7],
}

impl WeightTable {
    #[inline]
    pub fn weight(&self, group: PatientGroup, antigen: Antigen) -> Weight {
        self.rows[group.index()][antigen.index()]
    }

    /// Soft penalty, zero for mandatory antigens.
    #[inline]
    pub fn soft(&self, group: PatientGroup, antigen: Antigen) -> f64 {
        self.weight(group, antigen).soft()
    }

    /// Mask of the antigens `group` must match on within `panel`.
    pub fn must_mask(&self, group: PatientGroup, panel: &AntigenPanel) -> u32 {
        Antigen::ALL
            .iter()
            .filter(|a| self.weight(group, **a).is_mandatory())
            .fold(0, |m, a| m | a.bit())
            & panel.mask()
    }
}

/// Freshness penalty as a function of unit age. Both curves decay with
/// age so that older units are cheaper to issue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessCurve {
    /// `exp(-rate * age / max_age)`.
    Exponential { rate: f64 },
    /// `0.5^(age / days)`.
    HalfLife { days: f64 },
}

impl FreshnessCurve {
    pub fn penalty(&self, age: u32, max_age: u32) -> f64 {
        match *self {
            FreshnessCurve::Exponential { rate } => {
                (-rate * age as f64 / max_age.max(1) as f64).exp()
            }
            FreshnessCurve::HalfLife { days } => 0.5f64.powf(age as f64 / days),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            FreshnessCurve::Exponential { rate } if rate <= 0.0 || !rate.is_finite() => {
                Err(format!("exponential freshness rate must be positive, got {rate}"))
            }
            FreshnessCurve::HalfLife { days } if days <= 0.0 || !days.is_finite() => {
                Err(format!("freshness half-life must be positive, got {days}"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for FreshnessCurve {
    fn default() -> Self {
        FreshnessCurve::Exponential { rate: 4.852 }
    }
}

/// How the two objective tiers are combined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMode {
    /// Shortage cost first, quality cost only among shortage-optimal plans.
    Lexicographic,
    /// `tier1_scale * shortage + quality` as a single scalar.
    ScaledSum { tier1_scale: f64 },
}

impl ObjectiveMode {
    /// Orders `(shortage, quality)` pairs, lowest first. Values within
    /// `eps` are equal.
    pub fn compare(&self, a: (f64, f64), b: (f64, f64), eps: f64) -> Ordering {
        match *self {
            ObjectiveMode::Lexicographic => {
                if (a.0 - b.0).abs() > eps {
                    a.0.total_cmp(&b.0)
                } else if (a.1 - b.1).abs() > eps {
                    a.1.total_cmp(&b.1)
                } else {
                    Ordering::Equal
                }
            }
            ObjectiveMode::ScaledSum { tier1_scale } => {
                let sa = tier1_scale * a.0 + a.1;
                let sb = tier1_scale * b.0 + b.1;
                if (sa - sb).abs() > eps {
                    sa.total_cmp(&sb)
                } else {
                    Ordering::Equal
                }
            }
        }
    }

    /// Single scalar used by the annealing search.
    pub fn scalar(&self, cost: (f64, f64)) -> f64 {
        match *self {
            ObjectiveMode::Lexicographic => 1e6 * cost.0 + cost.1,
            ObjectiveMode::ScaledSum { tier1_scale } => tier1_scale * cost.0 + cost.1,
        }
    }
}

impl Default for ObjectiveMode {
    fn default() -> Self {
        ObjectiveMode::Lexicographic
    }
}

/// Matching policy for every solve of a run.
///
/// # Examples
///
/// ```
/// use rbc_matching::config::{FreshnessCurve, MatchingConfig, WeightStrategy};
///
/// let config = MatchingConfig::default()
///     .with_max_age(35)
///     .with_weights(WeightStrategy::relative_immunogenicity())
///     .with_freshness(FreshnessCurve::HalfLife { days: 5.0 });
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minor antigens considered for matching.
    pub panel: AntigenPanel,
    /// Shelf life in days; a unit may be issued up to age `max_age - 1`.
    pub max_age: u32,
    pub weights: WeightStrategy,
    pub freshness: FreshnessCurve,
    /// Multiplier on mismatch weights in the quality tier.
    pub mismatch_multiplier: f64,
    /// Extra shortage penalty for requests due today. `None` uses the
    /// number of requests in the solve.
    pub shortage_penalty_scale: Option<f64>,
    pub objective: ObjectiveMode,
    /// Population mix used for usability.
    pub population: Vec<(Ethnicity, f64)>,
    pub solver: SolverConfig,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            panel: AntigenPanel::full(),
            max_age: 35,
            weights: WeightStrategy::default(),
            freshness: FreshnessCurve::default(),
            mismatch_multiplier: 5.0,
            shortage_penalty_scale: None,
            objective: ObjectiveMode::default(),
            population: vec![(Ethnicity::Caucasian, 1.0)],
            solver: SolverConfig::default(),
        }
    }
}

impl MatchingConfig {
    pub fn with_panel(mut self, panel: AntigenPanel) -> Self {
        self.panel = panel;
        self
    }

    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_weights(mut self, weights: WeightStrategy) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_freshness(mut self, curve: FreshnessCurve) -> Self {
        self.freshness = curve;
        self
    }

    pub fn with_mismatch_multiplier(mut self, m: f64) -> Self {
        self.mismatch_multiplier = m;
        self
    }

    pub fn with_shortage_penalty_scale(mut self, scale: f64) -> Self {
        self.shortage_penalty_scale = Some(scale);
        self
    }

    pub fn with_objective(mut self, mode: ObjectiveMode) -> Self {
        self.objective = mode;
        self
    }

    pub fn with_population(mut self, mix: Vec<(Ethnicity, f64)>) -> Self {
        self.population = mix;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Parses a JSON configuration and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(MatchError::InvalidConfig)?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_age == 0 {
            return Err("max_age must be at least 1".into());
        }
        if self.mismatch_multiplier < 0.0 || !self.mismatch_multiplier.is_finite() {
            return Err(format!(
                "mismatch_multiplier must be non-negative, got {}",
                self.mismatch_multiplier
            ));
        }
        if let Some(scale) = self.shortage_penalty_scale {
            if scale < 0.0 || !scale.is_finite() {
                return Err(format!("shortage_penalty_scale must be non-negative, got {scale}"));
            }
        }
        if let ObjectiveMode::ScaledSum { tier1_scale } = self.objective {
            if tier1_scale <= 0.0 || !tier1_scale.is_finite() {
                return Err(format!("tier1_scale must be positive, got {tier1_scale}"));
            }
        }
        self.freshness.validate()?;
        self.weights.resolve().map_err(|e| e.to_string())?;
        self.prevalence().map_err(|e| e.to_string())?;
        self.solver.validate()
    }

    /// Prevalence tables for the configured population mix.
    pub fn prevalence(&self) -> Result<PrevalenceTables> {
        PrevalenceTables::mixed(&self.population)
    }
}

/// A location served in a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalConfig {
    pub name: String,
    /// Target inventory size.
    pub capacity: usize,
}

impl HospitalConfig {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

/// Simulation topology and horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Warm-up days; their reports are flagged and excluded from summaries.
    pub init_days: u32,
    /// Evaluated days after warm-up.
    pub test_days: u32,
    pub hospitals: Vec<HospitalConfig>,
    /// Distribution center capacity; `None` runs every hospital alone.
    pub dc_capacity: Option<usize>,
    pub seed: u64,
    /// Directory for per-day checkpoints.
    pub checkpoint_dir: Option<PathBuf>,
    /// Write a checkpoint every this many days (0 disables).
    pub checkpoint_every: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            init_days: 0,
            test_days: 30,
            hospitals: vec![HospitalConfig::new("hospital", 50)],
            dc_capacity: None,
            seed: 42,
            checkpoint_dir: None,
            checkpoint_every: 0,
        }
    }
}

impl SimulationConfig {
    pub fn with_days(mut self, init_days: u32, test_days: u32) -> Self {
        self.init_days = init_days;
        self.test_days = test_days;
        self
    }

    pub fn with_hospitals(mut self, hospitals: Vec<HospitalConfig>) -> Self {
        self.hospitals = hospitals;
        self
    }

    pub fn with_dc_capacity(mut self, capacity: usize) -> Self {
        self.dc_capacity = Some(capacity);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>, every: u32) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self.checkpoint_every = every;
        self
    }

    /// Total simulated days.
    pub fn horizon(&self) -> u32 {
        self.init_days + self.test_days
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.hospitals.is_empty() {
            return Err("at least one hospital is required".into());
        }
        if self.dc_capacity.is_none() && self.hospitals.len() > 1 {
            return Err("several hospitals need a distribution center".into());
        }
        if self.checkpoint_every > 0 && self.checkpoint_dir.is_none() {
            return Err("checkpoint_every set without checkpoint_dir".into());
        }
        Ok(())
    }
}
