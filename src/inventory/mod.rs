//! Stateful inventory entities: units, requests and per-location ledgers.

mod ledger;
mod request;
mod unit;

pub use ledger::{InventoryLedger, Turnover};
pub use request::{PatientGroup, Request, RequestBook};
pub use unit::{IdMint, InventoryUnit, RequestId, UnitId};
