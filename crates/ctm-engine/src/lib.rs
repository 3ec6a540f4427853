//! Charge orchestration engine.
//!
//! This crate is the pure core of the billing system plus the seams the
//! rest of the workspace plugs into:
//!
//! - [`state_machine`] — the charge lifecycle state machine, side-effect
//!   free and exhaustively tested.
//! - [`gateway`] — the [`GatewayClient`] contract both payment backends
//!   implement, and [`GatewaySet`], the only place a gateway variant is
//!   resolved to a client.
//! - [`store`] — the [`ChargeStore`] repository seam. Transition commits
//!   are status-guarded so the store is the single serialization point for
//!   a charge's lifecycle.
//! - [`orchestrator`] — drives charge creation and retries end to end.
//!
//! No HTTP, no SQL, and no wire formats live here.

pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod state_machine;
pub mod store;

pub use error::BillingError;
pub use gateway::{
    CreateChargeCall, GatewayAcceptance, GatewayChargeStatus, GatewayClient, GatewayError,
    GatewaySet, WebhookNotice,
};
pub use orchestrator::{
    CreateChargeRequest, GatewayRouting, Orchestrator, OrchestratorLimits, ProductCatalog,
};
pub use state_machine::{transition, ChargeEvent, ChargeState, TransitionError, DEFAULT_MAX_RETRIES};
pub use store::{
    ChargeRecord, ChargeStore, CommitOutcome, NewCharge, NewWebhookEvent, StoreError,
    TransitionUpdate, WebhookLedgerEntry,
};
