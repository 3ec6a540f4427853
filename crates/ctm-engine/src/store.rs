//! Charge repository seam.
//!
//! The store is the single serialization point for a charge's lifecycle:
//! [`ChargeStore::commit_transition`] is a status-guarded write (optimistic
//! concurrency on the stored `status`), and the uniqueness of
//! `idempotency_key` and `(gateway, gateway_event_id)` is enforced by the
//! backing store as a hard constraint — implementations must never
//! check-then-act on either.
//!
//! Two implementations exist: Postgres (`ctm-db`) and an in-memory store
//! for tests (`ctm-testkit`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::ChargeState;
use ctm_schemas::{
    BillingType, ChargeItem, Currency, Customer, DueDate, GatewayAssignment, GatewayVariant, Money,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A persisted charge with its items.
///
/// `total_amount` is derived, never stored: items are immutable after
/// creation, so the recomputation is a plain sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub charge_id: Uuid,
    pub customer_id: Uuid,
    pub billing_type: BillingType,
    pub status: ChargeState,
    pub gateway_used: GatewayVariant,
    /// The gateway's transaction id. Written exactly once, on the
    /// CREATED/RETRYING → PENDING commit.
    pub external_id: Option<String>,
    pub due_date: DueDate,
    pub idempotency_key: String,
    pub currency: Currency,
    pub retry_count: i32,
    pub items: Vec<ChargeItem>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

impl ChargeRecord {
    /// Sum of item amounts. The store guarantees ≥1 item, all positive,
    /// all in `self.currency`.
    pub fn total_amount(&self) -> Money {
        let minor: i64 = self.items.iter().map(|i| i.amount.minor_units()).sum();
        Money::new(minor, self.currency)
    }
}

/// Input for charge creation. Inserted atomically with its item rows in
/// state `CREATED`.
#[derive(Debug, Clone)]
pub struct NewCharge {
    pub charge_id: Uuid,
    pub customer_id: Uuid,
    pub billing_type: BillingType,
    pub gateway_used: GatewayVariant,
    pub due_date: DueDate,
    pub idempotency_key: String,
    pub currency: Currency,
    pub items: Vec<ChargeItem>,
}

/// A status-guarded transition write.
///
/// The commit applies `next` only if the stored status still equals
/// `expected`; otherwise it reports [`CommitOutcome::Conflict`] and writes
/// nothing.
#[derive(Debug, Clone)]
pub struct TransitionUpdate {
    pub charge_id: Uuid,
    pub expected: ChargeState,
    pub next: ChargeState,
    /// Set the gateway transaction id as part of the same commit.
    /// Only legal when the stored `external_id` is still NULL.
    pub set_external_id: Option<String>,
    /// Increment `retry_count` as part of the same commit.
    pub bump_retry: bool,
}

/// Result of a guarded commit.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The guard held and the transition was written.
    Applied(ChargeRecord),
    /// A concurrent writer committed first; `actual` is the status that
    /// was found. Nothing was written.
    Conflict { actual: ChargeState },
}

// ---------------------------------------------------------------------------
// Webhook ledger
// ---------------------------------------------------------------------------

/// Dedup ledger entry for one gateway event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLedgerEntry {
    pub gateway: GatewayVariant,
    pub gateway_event_id: String,
    pub charge_id: Uuid,
    pub received_status: String,
    pub received_at_utc: DateTime<Utc>,
    /// Set exactly once, in the same transaction as the charge transition
    /// (or the acknowledge-without-effect stamp for stale events).
    pub processed_at_utc: Option<DateTime<Utc>>,
}

/// Input for the first-sighting ledger insert.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub gateway: GatewayVariant,
    pub gateway_event_id: String,
    pub charge_id: Uuid,
    pub received_status: String,
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The `idempotency_key` unique constraint fired on insert.
    #[error("idempotency key already bound: {key:?}")]
    DuplicateIdempotencyKey { key: String },

    /// A guarded commit targeted a charge that does not exist.
    #[error("charge not found: {charge_id}")]
    ChargeNotFound { charge_id: Uuid },

    #[error("customer not found: {customer_id}")]
    CustomerNotFound { customer_id: Uuid },

    /// Anything the backend itself failed on (connectivity, SQL, etc).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// ChargeStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChargeStore: Send + Sync {
    /// Insert a charge and its items atomically, in state `CREATED`.
    ///
    /// The idempotency-key uniqueness race is closed here: concurrent
    /// duplicate submissions must resolve by constraint, with the loser
    /// receiving [`StoreError::DuplicateIdempotencyKey`].
    async fn insert_charge(&self, new: NewCharge) -> Result<ChargeRecord, StoreError>;

    async fn fetch_charge(&self, charge_id: Uuid) -> Result<Option<ChargeRecord>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str)
        -> Result<Option<ChargeRecord>, StoreError>;

    async fn find_by_external_id(
        &self,
        gateway: GatewayVariant,
        external_id: &str,
    ) -> Result<Option<ChargeRecord>, StoreError>;

    /// Status-guarded transition commit. See [`TransitionUpdate`].
    async fn commit_transition(&self, update: TransitionUpdate)
        -> Result<CommitOutcome, StoreError>;

    /// Look up a ledger entry by its natural key.
    async fn webhook_event(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<Option<WebhookLedgerEntry>, StoreError>;

    /// Deduped ledger insert: `true` if the row was created, `false` if
    /// the event was already recorded. Constraint-backed, never
    /// check-then-act.
    async fn record_webhook_received(&self, ev: NewWebhookEvent) -> Result<bool, StoreError>;

    /// The reconciler's commit: the charge transition and the ledger
    /// `processed_at` stamp land in one transaction, giving at-most-once
    /// business effect under at-least-once delivery.
    async fn commit_webhook_transition(
        &self,
        update: TransitionUpdate,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<CommitOutcome, StoreError>;

    /// Acknowledge an event without a charge effect (duplicate of an
    /// already-applied status, or stale/out-of-order delivery).
    async fn mark_webhook_processed(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<(), StoreError>;

    async fn fetch_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, StoreError>;

    /// Flip a customer's gateway assignment and append the migration-log
    /// row in the same transaction. The migration coordinator is the only
    /// caller.
    async fn set_gateway_assignment(
        &self,
        customer_id: Uuid,
        from: GatewayAssignment,
        to: GatewayAssignment,
    ) -> Result<(), StoreError>;

    /// Count this customer's non-terminal charges on the given gateway.
    async fn count_open_charges_on(
        &self,
        customer_id: Uuid,
        gateway: GatewayVariant,
    ) -> Result<i64, StoreError>;
}
