//! Billing error taxonomy.
//!
//! One enum spans the engine, reconciler, and migration coordinator so the
//! HTTP layer has a single surface to map onto status codes. Infra crates
//! (db, config, audit) use `anyhow` internally and surface here through
//! [`crate::store::StoreError`].

use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::state_machine::TransitionError;
use crate::store::StoreError;
use ctm_schemas::GatewayVariant;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Client input failed validation; never retried by the system.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown customer: {customer_id}")]
    UnknownCustomer { customer_id: Uuid },

    /// The idempotency key is already bound to a completed-or-in-flight
    /// charge. Safe no-op; the existing charge id is echoed so the caller
    /// can resolve without re-submitting.
    #[error("idempotency key {idempotency_key:?} already bound to charge {charge_id}")]
    DuplicateRequest {
        charge_id: Uuid,
        idempotency_key: String,
    },

    /// Transient gateway fault or timeout. The charge is left in a state
    /// that is safe to resubmit with the same idempotency key.
    #[error("gateway unavailable: {detail}")]
    GatewayUnavailable { detail: String },

    /// Permanent gateway rejection, with the gateway's reason code.
    #[error("gateway rejected charge: {reason}")]
    GatewayRejected { reason: String },

    /// Gateway credential/configuration fault. Surfaced, never retried.
    #[error("gateway authentication failed: {detail}")]
    GatewayAuth { detail: String },

    /// The event is not legal from the charge's current state. Expected
    /// for stale/out-of-order webhooks (logged and swallowed there);
    /// a fault anywhere else.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Webhook signature did not verify. Fail closed, no state change.
    #[error("webhook signature rejected")]
    SignatureInvalid,

    #[error("malformed webhook payload: {detail}")]
    MalformedWebhook { detail: String },

    /// Webhook references a transaction we have no charge for. Retryable
    /// at the HTTP layer: may be a race with charge creation.
    #[error("no charge for external id {external_id:?} on {gateway}")]
    UnknownCharge {
        gateway: GatewayVariant,
        external_id: String,
    },

    #[error("charge {charge_id} not found")]
    ChargeNotFound { charge_id: Uuid },

    /// The retry budget for this charge is spent; it has been moved to DEAD.
    #[error("charge {charge_id} has exhausted its retries")]
    RetriesExhausted { charge_id: Uuid },

    /// Operator guard: a migration cannot complete while legacy charges
    /// are still open.
    #[error("{open_charges} non-terminal legacy charge(s) block migration of customer {customer_id}")]
    MigrationIncomplete {
        customer_id: Uuid,
        open_charges: i64,
    },

    /// The optimistic transition guard lost every bounded attempt.
    #[error("concurrent transition conflict on charge {charge_id} not resolved")]
    Conflict { charge_id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BillingError {
    /// Map a gateway-boundary failure into the billing taxonomy.
    pub fn from_gateway(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable { detail } => BillingError::GatewayUnavailable { detail },
            GatewayError::Rejected { reason } => BillingError::GatewayRejected { reason },
            GatewayError::Auth { detail } => BillingError::GatewayAuth { detail },
            GatewayError::MalformedWebhook { detail } => BillingError::MalformedWebhook { detail },
        }
    }
}
