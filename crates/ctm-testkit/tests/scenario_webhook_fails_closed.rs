//! Scenario: the reconciler's front door — bad signatures and malformed
//! payloads are rejected with no state change, and events for unknown
//! transactions stay retryable.

use ctm_engine::{BillingError, ChargeState};
use ctm_gateway_sandbox::SandboxGateway;
use ctm_schemas::{GatewayAssignment, GatewayVariant};
use ctm_testkit::BillingRig;

#[tokio::test]
async fn bad_signature_is_rejected_without_state_change() {
    let rig = BillingRig::new();
    let customer = rig.add_customer(GatewayAssignment::Current).await;
    let charge = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-sig"))
        .await
        .unwrap();

    let body = SandboxGateway::webhook_body(
        "evt-forged",
        charge.external_id.as_deref().unwrap(),
        "paid",
    );
    // Signed with the wrong gateway's secret.
    let wrong_sig = rig.legacy.sign(&body);

    let err = rig
        .reconciler
        .handle_webhook(GatewayVariant::Current, &body, &wrong_sig)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SignatureInvalid));

    let unchanged = rig.orchestrator.get_charge(charge.charge_id).await.unwrap();
    assert_eq!(unchanged.status, ChargeState::Pending);
    assert_eq!(rig.store.webhook_event_count().await, 0, "nothing ledgered");
}

#[tokio::test]
async fn malformed_payload_with_valid_signature_is_rejected() {
    let rig = BillingRig::new();

    let body = br#"{"not": "a webhook"}"#;
    let sig = rig.current.sign(body);

    let err = rig
        .reconciler
        .handle_webhook(GatewayVariant::Current, body, &sig)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::MalformedWebhook { .. }));
}

#[tokio::test]
async fn event_for_unknown_transaction_is_retryable() {
    let rig = BillingRig::new();

    let body = SandboxGateway::webhook_body("evt-early", "sbx-cur-not-yet-created", "paid");
    let sig = rig.current.sign(&body);

    let err = rig
        .reconciler
        .handle_webhook(GatewayVariant::Current, &body, &sig)
        .await
        .unwrap_err();
    match err {
        BillingError::UnknownCharge { external_id, .. } => {
            assert_eq!(external_id, "sbx-cur-not-yet-created");
        }
        other => panic!("expected UnknownCharge, got {other}"),
    }
}

/// A legacy-gateway notification citing a charge that was created on the
/// current gateway after DUAL began: there is no legacy charge with that
/// transaction id, so the event resolves to UnknownCharge.
#[tokio::test]
async fn legacy_webhook_for_post_dual_charge_is_unknown() {
    let rig = BillingRig::new();
    let customer = rig.add_customer(GatewayAssignment::Legacy).await;
    rig.migrations.begin_dual(customer.customer_id).await.unwrap();

    let charge = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-post-dual"))
        .await
        .unwrap();
    assert_eq!(charge.gateway_used, GatewayVariant::Current);
    let external_id = charge.external_id.clone().unwrap();

    // The legacy gateway has no business knowing this transaction.
    let body = SandboxGateway::webhook_body("leg-evt-x", &external_id, "paid");
    let sig = rig.legacy.sign(&body);

    let err = rig
        .reconciler
        .handle_webhook(GatewayVariant::Legacy, &body, &sig)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnknownCharge { .. }));

    let unchanged = rig.orchestrator.get_charge(charge.charge_id).await.unwrap();
    assert_eq!(unchanged.status, ChargeState::Pending);
}
