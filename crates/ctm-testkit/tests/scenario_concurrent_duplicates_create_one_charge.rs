//! Scenario: N concurrent submissions with one idempotency key create
//! exactly one charge, and every response references that charge.

use std::sync::Arc;

use ctm_engine::{BillingError, ChargeState, ChargeStore};
use ctm_schemas::GatewayAssignment;
use ctm_testkit::BillingRig;

#[tokio::test]
async fn eight_concurrent_submissions_one_charge() {
    let rig = Arc::new(BillingRig::new());
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rig = Arc::clone(&rig);
        let customer_id = customer.customer_id;
        handles.push(tokio::spawn(async move {
            rig.orchestrator
                .create_charge(BillingRig::request(customer_id, "key-race"))
                .await
        }));
    }

    let mut referenced_ids = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            // Winner of the insert race, or a resumer that finished the
            // submission: both return the charge itself.
            Ok(charge) => referenced_ids.push(charge.charge_id),
            // Losers that found the charge already past CREATED.
            Err(BillingError::DuplicateRequest { charge_id, .. }) => {
                referenced_ids.push(charge_id)
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(rig.store.charge_count().await, 1, "exactly one charge");
    let charge = rig
        .store
        .find_by_idempotency_key("key-race")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(charge.status, ChargeState::Pending);
    assert!(
        referenced_ids.iter().all(|id| *id == charge.charge_id),
        "all N responses reference the single charge"
    );
}

#[tokio::test]
async fn sequential_duplicate_after_settlement_is_a_conflict() {
    let rig = BillingRig::new();
    let customer = rig.add_customer(GatewayAssignment::Current).await;

    let charge = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-dup"))
        .await
        .unwrap();

    let err = rig
        .orchestrator
        .create_charge(BillingRig::request(customer.customer_id, "key-dup"))
        .await
        .unwrap_err();
    match err {
        BillingError::DuplicateRequest {
            charge_id,
            idempotency_key,
        } => {
            assert_eq!(charge_id, charge.charge_id);
            assert_eq!(idempotency_key, "key-dup");
        }
        other => panic!("expected DuplicateRequest, got {other}"),
    }
    assert_eq!(rig.store.charge_count().await, 1);
}
