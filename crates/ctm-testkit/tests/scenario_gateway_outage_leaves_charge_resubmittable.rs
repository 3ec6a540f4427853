//! Scenario: when the gateway is unreachable (or the call times out) the
//! charge stays CREATED and the same idempotency key resubmits safely —
//! exactly one charge ever exists.

use std::time::Duration;

use ctm_engine::{BillingError, ChargeState, ChargeStore, GatewayError, OrchestratorLimits};
use ctm_schemas::GatewayAssignment;
use ctm_testkit::BillingRig;

#[tokio::test]
async fn unavailable_gateway_then_successful_resubmission() {
    let rig = BillingRig::new();
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    rig.current.fail_next(GatewayError::Unavailable {
        detail: "connection refused".into(),
    });

    let err = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-outage"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::GatewayUnavailable { .. }));

    // The charge exists, is CREATED, and has no transaction id.
    assert_eq!(rig.store.charge_count().await, 1);
    let parked = rig
        .store
        .find_by_idempotency_key("key-outage")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, ChargeState::Created);
    assert!(parked.external_id.is_none());

    // Connectivity restores; the same key resumes the same charge.
    let charge = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-outage"))
        .await
        .unwrap();
    assert_eq!(charge.charge_id, parked.charge_id);
    assert_eq!(charge.status, ChargeState::Pending);
    assert!(charge.external_id.is_some());

    assert_eq!(rig.store.charge_count().await, 1, "no second charge");
    assert_eq!(rig.current.submission_count(), 2);
}

#[tokio::test]
async fn gateway_auth_fault_also_leaves_charge_created() {
    let rig = BillingRig::new();
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    rig.current.fail_next(GatewayError::Auth {
        detail: "bad api key".into(),
    });

    let err = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-auth"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::GatewayAuth { .. }));

    let parked = rig
        .store
        .find_by_idempotency_key("key-auth")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, ChargeState::Created);
}

#[tokio::test]
async fn slow_gateway_hits_the_orchestrator_timeout() {
    let rig = BillingRig::with_limits(OrchestratorLimits {
        gateway_timeout: Duration::from_millis(50),
        ..OrchestratorLimits::default()
    });
    let customer = rig.add_customer(GatewayAssignment::Current).await;
    // A gateway that hangs far past the orchestrator's deadline.
    rig.current.set_latency(Duration::from_secs(60));

    let err = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::GatewayUnavailable { .. }));

    let parked = rig
        .store
        .find_by_idempotency_key("key-slow")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, ChargeState::Created);
    assert!(
        parked.external_id.is_none(),
        "unknown outcome must never be recorded as success"
    );
}
