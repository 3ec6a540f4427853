//! Scenario: the FAILED → RETRYING → PENDING loop is drivable and the
//! retry budget is hard — once spent, the charge moves to DEAD and stays
//! there.

use std::time::Duration;

use ctm_engine::{BillingError, ChargeState, ChargeStore, GatewayError, OrchestratorLimits};
use ctm_gateway_sandbox::SandboxGateway;
use ctm_reconcile::WebhookOutcome;
use ctm_schemas::{GatewayAssignment, GatewayVariant};
use ctm_testkit::BillingRig;

fn small_budget() -> OrchestratorLimits {
    OrchestratorLimits {
        gateway_timeout: Duration::from_millis(500),
        commit_attempts: 3,
        max_retries: 2,
    }
}

/// Settle the charge's current pending submission as failed via webhook.
async fn fail_via_webhook(rig: &BillingRig, external_id: &str, event_id: &str) {
    let body = SandboxGateway::webhook_body(event_id, external_id, "failed");
    let sig = rig.current.sign(&body);
    let outcome = rig
        .reconciler
        .handle_webhook(GatewayVariant::Current, &body, &sig)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));
}

#[tokio::test]
async fn rejected_charge_recovers_through_retry() {
    let rig = BillingRig::with_limits(small_budget());
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    rig.current.fail_next(GatewayError::Rejected {
        reason: "insufficient_funds".into(),
    });
    let err = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-retry"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::GatewayRejected { .. }));

    let failed = rig
        .store
        .find_by_idempotency_key("key-retry")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, ChargeState::Failed);

    // First retry: gateway accepts.
    let retried = rig.orchestrator.retry_charge(failed.charge_id).await.unwrap();
    assert_eq!(retried.status, ChargeState::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.external_id.is_some());
}

#[tokio::test]
async fn retry_budget_exhaustion_moves_charge_to_dead() {
    let rig = BillingRig::with_limits(small_budget());
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    rig.current.fail_next(GatewayError::Rejected {
        reason: "card_declined".into(),
    });
    let _ = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-dead"))
        .await
        .unwrap_err();
    let charge = rig
        .store
        .find_by_idempotency_key("key-dead")
        .await
        .unwrap()
        .unwrap();

    // Burn the budget: each retry is accepted, then fails to settle.
    for round in 0..2 {
        let pending = rig.orchestrator.retry_charge(charge.charge_id).await.unwrap();
        assert_eq!(pending.status, ChargeState::Pending);
        assert_eq!(pending.retry_count, round + 1);
        fail_via_webhook(
            &rig,
            pending.external_id.as_deref().unwrap(),
            &format!("evt-fail-{round}"),
        )
        .await;
    }

    // Budget (2) is spent: the next retry request kills the charge.
    let err = rig
        .orchestrator
        .retry_charge(charge.charge_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::RetriesExhausted { .. }));

    let dead = rig.orchestrator.get_charge(charge.charge_id).await.unwrap();
    assert_eq!(dead.status, ChargeState::Dead);

    // DEAD is terminal: another retry is an invalid transition.
    let err = rig
        .orchestrator
        .retry_charge(charge.charge_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}

#[tokio::test]
async fn retry_on_a_pending_charge_is_rejected() {
    let rig = BillingRig::with_limits(small_budget());
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    let charge = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-np"))
        .await
        .unwrap();
    assert_eq!(charge.status, ChargeState::Pending);

    let err = rig
        .orchestrator
        .retry_charge(charge.charge_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));
}
