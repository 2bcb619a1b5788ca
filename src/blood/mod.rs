//! Antigens, phenotypes and population prevalence.
//!
//! Everything here is immutable once built and shared by reference across a
//! run: phenotypes are `Copy` bit masks and prevalence tables are loaded once
//! per configuration.

mod antigen;
mod profile;
mod usability;

pub use antigen::{
    Antigen, AntigenPanel, AntigenSystem, ANTIGEN_COUNT, FULL_MASK, MAJOR_MASK,
};
pub use profile::{BloodProfile, MajorGroup};
pub use usability::{Ethnicity, PrevalenceTables, SystemPrevalence};
