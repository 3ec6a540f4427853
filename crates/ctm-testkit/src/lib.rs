//! Test support for the billing workspace.
//!
//! [`MemoryChargeStore`] implements the engine's `ChargeStore` contract
//! in-process — same guarded-commit and constraint semantics as the
//! Postgres store, one mutex instead of transactions — so scenario tests
//! run without a database. [`BillingRig`] wires a full stack (memory
//! store, sandbox gateways, coordinator, orchestrator, reconciler) with
//! deterministic defaults.

pub mod memory;
pub mod rig;

pub use memory::MemoryChargeStore;
pub use rig::{BillingRig, StaticCatalog};
