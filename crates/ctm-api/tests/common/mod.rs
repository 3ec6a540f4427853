//! Router harness for in-process HTTP tests: the full app wired to the
//! in-memory store and sandbox gateways, driven with oneshot requests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use ctm_api::routes::build_router;
use ctm_api::state::AppState;
use ctm_testkit::BillingRig;

pub struct ApiHarness {
    pub rig: BillingRig,
    pub router: Router,
}

pub fn harness() -> ApiHarness {
    let rig = BillingRig::new();
    let state = Arc::new(AppState::new(
        rig.orchestrator.clone(),
        rig.reconciler.clone(),
        rig.migrations.clone(),
    ));
    ApiHarness {
        rig,
        router: build_router(state),
    }
}

pub async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(req)
        .await
        .expect("router never errors");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response is JSON")
    };
    (status, value)
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

pub fn post_webhook(uri: &str, body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header("Gateway-Signature", sig);
    }
    builder.body(Body::from(body)).expect("build request")
}

pub fn charge_body(customer_id: uuid::Uuid, idempotency_key: &str) -> Value {
    serde_json::json!({
        "customer_id": customer_id,
        "products": [
            {"product_type": "PMS", "product_id": 1, "amount": 20000},
            {"product_type": "Motor", "product_id": 2, "amount": 5000}
        ],
        "billing_type": "RECURRING",
        "due_date": "2026-09-01",
        "idempotency_key": idempotency_key,
    })
}
