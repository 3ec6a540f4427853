//! Axum router and all HTTP handlers for ctm-api.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.
//!
//! Status-code contract:
//!
//! | condition                          | status |
//! |------------------------------------|--------|
//! | charge created / resumed           | 201    |
//! | duplicate idempotency key          | 409    |
//! | validation failure                 | 422    |
//! | gateway unavailable / timed out    | 502    |
//! | gateway rejected (permanent)       | 424    |
//! | webhook handled (any outcome)      | 200    |
//! | webhook signature/parse failure    | 400    |
//! | webhook for unknown charge         | 503    |

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::warn;
use uuid::Uuid;

use ctm_engine::{BillingError, CreateChargeRequest};
use ctm_reconcile::WebhookOutcome;
use ctm_schemas::{BillingType, ChargeItem, Currency, Customer, GatewayVariant, Money, ProductRef};

use crate::api_types::{
    ChargeCreatedResponse, ChargeSnapshotResponse, CreateChargeBody, ErrorResponse,
    HealthResponse, MigrationResponse, WebhookAckResponse,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/charges", post(create_charge))
        .route("/api/v1/charges/:id", get(get_charge))
        .route("/api/v1/charges/:id/retry", post(retry_charge))
        .route("/api/v1/webhooks/:gateway", post(handle_webhook))
        .route(
            "/api/v1/customers/:id/migration/mark-legacy",
            post(migration_mark_legacy),
        )
        .route(
            "/api/v1/customers/:id/migration/begin-dual",
            post(migration_begin_dual),
        )
        .route(
            "/api/v1/customers/:id/migration/complete",
            post(migration_complete),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(err: BillingError) -> Response {
    let status = match &err {
        BillingError::Validation(_) | BillingError::UnknownCustomer { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BillingError::DuplicateRequest { .. } => StatusCode::CONFLICT,
        BillingError::GatewayUnavailable { .. } => StatusCode::BAD_GATEWAY,
        BillingError::GatewayRejected { .. } => StatusCode::FAILED_DEPENDENCY,
        BillingError::GatewayAuth { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        BillingError::SignatureInvalid | BillingError::MalformedWebhook { .. } => {
            StatusCode::BAD_REQUEST
        }
        // Usually a race with charge creation; invite redelivery.
        BillingError::UnknownCharge { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::ChargeNotFound { .. } => StatusCode::NOT_FOUND,
        BillingError::InvalidTransition(_)
        | BillingError::RetriesExhausted { .. }
        | BillingError::MigrationIncomplete { .. } => StatusCode::CONFLICT,
        BillingError::Conflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = ErrorResponse::new(err.to_string());
    if let BillingError::DuplicateRequest {
        charge_id,
        idempotency_key,
    } = &err
    {
        body.charge_id = Some(*charge_id);
        body.idempotency_key = Some(idempotency_key.clone());
    }

    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /api/v1/charges
// ---------------------------------------------------------------------------

fn items_from_body(body: &CreateChargeBody) -> Result<Vec<ChargeItem>, BillingError> {
    let mut items = Vec::with_capacity(body.products.len());
    for line in &body.products {
        let currency = match line.currency.as_deref() {
            None => Currency::Brl,
            Some(code) => Currency::parse(code)
                .ok_or_else(|| BillingError::Validation(format!("unknown currency {code:?}")))?,
        };
        let amount = Money::positive(line.amount, currency)
            .map_err(|e| BillingError::Validation(e.to_string()))?;
        let item = ChargeItem::new(
            ProductRef::new(line.product_type.clone(), line.product_id),
            amount,
        )
        .map_err(|e| BillingError::Validation(e.to_string()))?;
        items.push(item);
    }
    Ok(items)
}

pub(crate) async fn create_charge(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateChargeBody>,
) -> Response {
    let billing_type = match BillingType::parse(&body.billing_type) {
        Some(bt) => bt,
        None => {
            return error_response(BillingError::Validation(format!(
                "billing_type must be ONE_TIME or RECURRING, got {:?}",
                body.billing_type
            )))
        }
    };
    let items = match items_from_body(&body) {
        Ok(items) => items,
        Err(err) => return error_response(err),
    };

    let request = CreateChargeRequest {
        customer_id: body.customer_id,
        items,
        billing_type,
        due_date: body.due_date,
        idempotency_key: body.idempotency_key,
    };

    match st.orchestrator.create_charge(request).await {
        Ok(charge) => (
            StatusCode::CREATED,
            Json(ChargeCreatedResponse {
                id: charge.charge_id,
                status: charge.status.as_str().to_string(),
                total_amount: charge.total_amount().minor_units(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/charges/:id
// ---------------------------------------------------------------------------

pub(crate) async fn get_charge(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.orchestrator.get_charge(id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(ChargeSnapshotResponse::from_record(&record)),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/charges/:id/retry
// ---------------------------------------------------------------------------

pub(crate) async fn retry_charge(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.orchestrator.retry_charge(id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(ChargeCreatedResponse {
                id: record.charge_id,
                status: record.status.as_str().to_string(),
                total_amount: record.total_amount().minor_units(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/webhooks/:gateway
// ---------------------------------------------------------------------------

/// Signature header names, in lookup order. The current gateway sends
/// `Gateway-Signature`; the legacy gateway sends `X-Hook-Signature`.
const SIGNATURE_HEADERS: [&str; 2] = ["gateway-signature", "x-hook-signature"];

fn signature_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in SIGNATURE_HEADERS {
        if let Some(value) = headers.get(name) {
            return value.to_str().ok().map(str::to_string);
        }
    }
    None
}

fn outcome_label(outcome: &WebhookOutcome) -> &'static str {
    match outcome {
        WebhookOutcome::Applied { .. } => "applied",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::OutOfOrder { .. } => "out_of_order",
        WebhookOutcome::Ignored { .. } => "ignored",
    }
}

pub(crate) async fn handle_webhook(
    State(st): State<Arc<AppState>>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(variant) = GatewayVariant::parse(&gateway) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("unknown gateway {gateway:?}"))),
        )
            .into_response();
    };
    let Some(signature) = signature_from_headers(&headers) else {
        warn!(gateway = %variant, "webhook without signature header");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing signature header")),
        )
            .into_response();
    };

    match st.reconciler.handle_webhook(variant, &body, &signature).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WebhookAckResponse {
                outcome: outcome_label(&outcome).to_string(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Migration admin
// ---------------------------------------------------------------------------

fn migration_response(customer: Customer) -> Response {
    (
        StatusCode::OK,
        Json(MigrationResponse {
            customer_id: customer.customer_id,
            gateway_assignment: customer.gateway_assignment.as_str().to_string(),
        }),
    )
        .into_response()
}

pub(crate) async fn migration_mark_legacy(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.migrations.mark_legacy(id).await {
        Ok(customer) => migration_response(customer),
        Err(BillingError::UnknownCustomer { .. }) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse::new("unknown customer"))).into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn migration_begin_dual(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.migrations.begin_dual(id).await {
        Ok(customer) => migration_response(customer),
        Err(BillingError::UnknownCustomer { .. }) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse::new("unknown customer"))).into_response()
        }
        Err(err) => error_response(err),
    }
}

pub(crate) async fn migration_complete(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.migrations.complete_migration(id).await {
        Ok(customer) => migration_response(customer),
        Err(BillingError::UnknownCustomer { .. }) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse::new("unknown customer"))).into_response()
        }
        Err(err) => error_response(err),
    }
}
