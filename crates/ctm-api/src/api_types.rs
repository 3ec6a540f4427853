//! Request and response types for all ctm-api HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ctm_engine::ChargeRecord;

// ---------------------------------------------------------------------------
// /api/v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// POST /api/v1/charges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChargeBody {
    pub customer_id: Uuid,
    pub products: Vec<ProductLine>,
    /// "ONE_TIME" | "RECURRING"
    pub billing_type: String,
    pub due_date: NaiveDate,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductLine {
    pub product_type: String,
    pub product_id: i64,
    /// Minor units, must be positive.
    pub amount: i64,
    /// ISO-4217 code; defaults to BRL.
    #[serde(default)]
    pub currency: Option<String>,
}

/// The creation response: enough to poll and to retry safely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeCreatedResponse {
    pub id: Uuid,
    pub status: String,
    pub total_amount: i64,
}

// ---------------------------------------------------------------------------
// GET /api/v1/charges/:id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeSnapshotResponse {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: String,
    pub billing_type: String,
    pub gateway_used: String,
    pub external_id: Option<String>,
    pub due_date: NaiveDate,
    pub currency: String,
    pub total_amount: i64,
    pub retry_count: i32,
    pub items: Vec<ChargeItemView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeItemView {
    pub product_type: String,
    pub product_id: i64,
    pub amount: i64,
}

impl ChargeSnapshotResponse {
    pub fn from_record(record: &ChargeRecord) -> Self {
        Self {
            id: record.charge_id,
            customer_id: record.customer_id,
            status: record.status.as_str().to_string(),
            billing_type: record.billing_type.as_str().to_string(),
            gateway_used: record.gateway_used.as_str().to_string(),
            external_id: record.external_id.clone(),
            due_date: record.due_date,
            currency: record.currency.as_str().to_string(),
            total_amount: record.total_amount().minor_units(),
            retry_count: record.retry_count,
            items: record
                .items
                .iter()
                .map(|i| ChargeItemView {
                    product_type: i.product.product_type.clone(),
                    product_id: i.product.product_id,
                    amount: i.amount.minor_units(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/webhooks/:gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAckResponse {
    /// "applied" | "duplicate" | "out_of_order" | "ignored"
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Migration admin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResponse {
    pub customer_id: Uuid,
    pub gateway_assignment: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body with enough context to retry safely: the idempotency key
/// and charge id are echoed whenever they are known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            charge_id: None,
            idempotency_key: None,
        }
    }
}
