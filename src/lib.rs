//! Day-by-day allocation of perishable red-blood-cell units to patient
//! requests under partial antigen compatibility.
//!
//! The crate is organised leaf-first:
//!
//! - **Blood**: antigen catalogue, immutable phenotypes, population
//!   prevalence and usability.
//! - **Inventory**: units, requests and the per-location ledger that ages,
//!   expires, issues and restocks them.
//! - **Compat**: must-match and shelf-life feasibility between units and
//!   requests.
//! - **Model**: the daily assignment problem (shortage tier, quality tier),
//!   its linear export, and the tie-break chain over equally-optimal plans.
//! - **Solver**: the solver seam plus bundled exact, annealing and
//!   combined reference solvers.
//! - **Echelon**: single-hospital and hospital plus distribution center
//!   simulations, with checkpoints and parallel episodes.
//!
//! # Architecture
//!
//! Every run resolves its configuration once into immutable tables that are
//! passed by reference. A coordinator drives one simulated day at a time:
//! the compatibility engine precomputes feasible pairs, the allocation model
//! solves, the ledger applies the result, and a report is emitted.
//! Shortages and outdates are reported outcomes; only malformed data and
//! unsolvable models are errors.

pub mod blood;
pub mod checkpoint;
pub mod compat;
pub mod config;
pub mod echelon;
pub mod episode;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod model;
pub mod report;
pub mod scenario;
pub mod solver;

pub use blood::{Antigen, AntigenPanel, BloodProfile, MajorGroup};
pub use config::{HospitalConfig, MatchingConfig, SimulationConfig};
pub use echelon::{EchelonCoordinator, MultiEchelonCoordinator, SingleSiteCoordinator};
pub use error::{MatchError, Result};
pub use inventory::{InventoryLedger, InventoryUnit, PatientGroup, Request};
pub use model::{AllocationModel, Assignment};
pub use report::{DayReport, EpisodeSummary};
pub use solver::{AllocationSolver, SolverConfig, SolverStatus};
