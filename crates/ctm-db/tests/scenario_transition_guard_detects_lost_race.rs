//! Scenario: the status-guarded UPDATE is the serialization point — a
//! commit whose expected status is stale writes nothing and reports the
//! winner's state.

mod common;

use ctm_engine::{ChargeState, ChargeStore, CommitOutcome, TransitionUpdate};
use ctm_schemas::GatewayAssignment;
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires CTM_DATABASE_URL; run with --include-ignored"]
async fn stale_expected_status_conflicts_without_writing() {
    let store = common::connect_store().await;
    let customer = common::test_customer(GatewayAssignment::Current);
    store.insert_customer(&customer).await.unwrap();

    let key = format!("key-{}", Uuid::new_v4());
    let charge = store
        .insert_charge(common::new_charge(customer.customer_id, &key))
        .await
        .unwrap();

    // Writer A wins: CREATED → PENDING.
    let winner = TransitionUpdate {
        charge_id: charge.charge_id,
        expected: ChargeState::Created,
        next: ChargeState::Pending,
        set_external_id: Some("ext-winner".into()),
        bump_retry: false,
    };
    assert!(matches!(
        store.commit_transition(winner).await.unwrap(),
        CommitOutcome::Applied(_)
    ));

    // Writer B lost the read-modify-write race: still expects CREATED.
    let loser = TransitionUpdate {
        charge_id: charge.charge_id,
        expected: ChargeState::Created,
        next: ChargeState::Failed,
        set_external_id: None,
        bump_retry: false,
    };
    match store.commit_transition(loser).await.unwrap() {
        CommitOutcome::Conflict { actual } => assert_eq!(actual, ChargeState::Pending),
        CommitOutcome::Applied(_) => panic!("stale commit must not apply"),
    }

    // The winner's write is intact, external_id included.
    let record = store.fetch_charge(charge.charge_id).await.unwrap().unwrap();
    assert_eq!(record.status, ChargeState::Pending);
    assert_eq!(record.external_id.as_deref(), Some("ext-winner"));
}

#[tokio::test]
#[ignore = "requires CTM_DATABASE_URL; run with --include-ignored"]
async fn external_id_is_write_once() {
    let store = common::connect_store().await;
    let customer = common::test_customer(GatewayAssignment::Current);
    store.insert_customer(&customer).await.unwrap();

    let key = format!("key-{}", Uuid::new_v4());
    let charge = store
        .insert_charge(common::new_charge(customer.customer_id, &key))
        .await
        .unwrap();

    let first = TransitionUpdate {
        charge_id: charge.charge_id,
        expected: ChargeState::Created,
        next: ChargeState::Pending,
        set_external_id: Some("ext-first".into()),
        bump_retry: false,
    };
    assert!(matches!(
        store.commit_transition(first).await.unwrap(),
        CommitOutcome::Applied(_)
    ));

    // A later commit carrying a different external id must not overwrite.
    let second = TransitionUpdate {
        charge_id: charge.charge_id,
        expected: ChargeState::Pending,
        next: ChargeState::Paid,
        set_external_id: Some("ext-second".into()),
        bump_retry: false,
    };
    assert!(matches!(
        store.commit_transition(second).await.unwrap(),
        CommitOutcome::Applied(_)
    ));

    let record = store.fetch_charge(charge.charge_id).await.unwrap().unwrap();
    assert_eq!(record.external_id.as_deref(), Some("ext-first"));
}
