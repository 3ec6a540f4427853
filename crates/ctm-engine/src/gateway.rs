//! Payment gateway contract.
//!
//! Both backends (CURRENT and LEGACY) implement [`GatewayClient`] against
//! their own wire protocols. [`GatewaySet`] is the single place a
//! [`GatewayVariant`] is resolved to a client — no other code may branch on
//! gateway identity.
//!
//! A client is a plain value constructed with its own credentials and
//! endpoint; multiple instances coexist, there is no process-wide gateway
//! configuration.

use std::sync::Arc;

use async_trait::async_trait;
use ctm_schemas::{BillingType, ChargeItem, Customer, DueDate, GatewayVariant};

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

/// Everything a gateway needs to open a charge.
///
/// `reference` is the charge id and doubles as the gateway-side idempotency
/// handle: resubmitting the same reference must not open a second
/// transaction.
#[derive(Debug, Clone)]
pub struct CreateChargeCall {
    pub reference: String,
    pub customer: Customer,
    pub items: Vec<ChargeItem>,
    pub billing_type: BillingType,
    pub due_date: DueDate,
}

/// Gateway-side view of a charge's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayChargeStatus {
    /// Accepted, not yet settled.
    Pending,
    Paid,
    Failed,
    /// Anything the gateway reports that maps to none of the above
    /// (intermediate notifications, gateway-internal states).
    Other,
}

/// Successful `create_charge` outcome.
#[derive(Debug, Clone)]
pub struct GatewayAcceptance {
    /// The gateway's transaction id. Written to the charge exactly once.
    pub external_id: String,
    pub status: GatewayChargeStatus,
}

/// Parsed webhook notification, wire format already stripped.
#[derive(Debug, Clone)]
pub struct WebhookNotice {
    /// Unique per gateway; the dedup ledger key.
    pub gateway_event_id: String,
    /// The gateway's transaction id for the affected charge.
    pub external_id: String,
    pub status: GatewayChargeStatus,
    /// The status string exactly as the gateway reported it; kept on the
    /// ledger row for audit.
    pub raw_status: String,
}

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

/// Failure taxonomy of the gateway boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transient transport or gateway-side fault; safe to retry the whole
    /// request with the same idempotency key.
    #[error("gateway unavailable: {detail}")]
    Unavailable { detail: String },
    /// Permanent rejection with the gateway's reason code.
    #[error("gateway rejected: {reason}")]
    Rejected { reason: String },
    /// Credentials or configuration problem; never retried automatically.
    #[error("gateway authentication failed: {detail}")]
    Auth { detail: String },
    /// Inbound webhook payload is missing required fields.
    #[error("malformed webhook: {detail}")]
    MalformedWebhook { detail: String },
}

// ---------------------------------------------------------------------------
// GatewayClient
// ---------------------------------------------------------------------------

/// The contract each payment backend implements.
///
/// Object-safe on purpose: orchestrator and reconciler hold
/// `Arc<dyn GatewayClient>` and never see the concrete adapter.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Which variant this client speaks for. Used only by [`GatewaySet`]
    /// wiring assertions and log lines.
    fn variant(&self) -> GatewayVariant;

    /// Submit a charge. Resubmission with the same `reference` must be
    /// idempotent on the gateway side.
    async fn create_charge(&self, call: &CreateChargeCall)
        -> Result<GatewayAcceptance, GatewayError>;

    /// Poll the gateway for the current status of a transaction.
    async fn fetch_status(&self, external_id: &str)
        -> Result<GatewayChargeStatus, GatewayError>;

    /// Cryptographically verify an inbound webhook against this gateway's
    /// shared secret. Implementations must use a constant-time comparison.
    fn verify_webhook_signature(&self, raw_payload: &[u8], signature_header: &str) -> bool;

    /// Extract the event notice from a raw webhook body.
    fn parse_webhook(&self, raw_payload: &[u8]) -> Result<WebhookNotice, GatewayError>;
}

// ---------------------------------------------------------------------------
// GatewaySet
// ---------------------------------------------------------------------------

/// The pair of active gateway clients.
///
/// This is the only point in the system where a [`GatewayVariant`] becomes
/// a concrete client. During a migration window both clients are live: new
/// charges go wherever routing says, webhooks go to the variant that
/// delivered them.
#[derive(Clone)]
pub struct GatewaySet {
    current: Arc<dyn GatewayClient>,
    legacy: Arc<dyn GatewayClient>,
}

impl GatewaySet {
    pub fn new(current: Arc<dyn GatewayClient>, legacy: Arc<dyn GatewayClient>) -> Self {
        debug_assert_eq!(current.variant(), GatewayVariant::Current);
        debug_assert_eq!(legacy.variant(), GatewayVariant::Legacy);
        Self { current, legacy }
    }

    pub fn select(&self, variant: GatewayVariant) -> &Arc<dyn GatewayClient> {
        match variant {
            GatewayVariant::Current => &self.current,
            GatewayVariant::Legacy => &self.legacy,
        }
    }
}
