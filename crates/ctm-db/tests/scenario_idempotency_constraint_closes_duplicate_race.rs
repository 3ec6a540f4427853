//! Scenario: the idempotency-key unique constraint — not application
//! logic — decides duplicate submissions.

mod common;

use ctm_engine::{ChargeStore, StoreError};
use ctm_schemas::GatewayAssignment;
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires CTM_DATABASE_URL; run with --include-ignored"]
async fn second_insert_with_same_key_is_rejected_by_constraint() {
    let store = common::connect_store().await;
    let customer = common::test_customer(GatewayAssignment::Current);
    store.insert_customer(&customer).await.unwrap();

    let key = format!("key-{}", Uuid::new_v4());

    let first = store
        .insert_charge(common::new_charge(customer.customer_id, &key))
        .await
        .unwrap();

    let err = store
        .insert_charge(common::new_charge(customer.customer_id, &key))
        .await
        .unwrap_err();
    match err {
        StoreError::DuplicateIdempotencyKey { key: bound } => assert_eq!(bound, key),
        other => panic!("expected DuplicateIdempotencyKey, got {other:?}"),
    }

    // The key resolves to exactly the first charge.
    let found = store.find_by_idempotency_key(&key).await.unwrap().unwrap();
    assert_eq!(found.charge_id, first.charge_id);
}

#[tokio::test]
#[ignore = "requires CTM_DATABASE_URL; run with --include-ignored"]
async fn concurrent_inserts_with_same_key_create_one_charge() {
    let store = common::connect_store().await;
    let customer = common::test_customer(GatewayAssignment::Current);
    store.insert_customer(&customer).await.unwrap();

    let key = format!("key-{}", Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let key = key.clone();
        let customer_id = customer.customer_id;
        handles.push(tokio::spawn(async move {
            store.insert_charge(common::new_charge(customer_id, &key)).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(StoreError::DuplicateIdempotencyKey { .. }) => duplicates += 1,
            Err(other) => panic!("unexpected store error: {other:?}"),
        }
    }
    assert_eq!(created, 1, "exactly one winner");
    assert_eq!(duplicates, 7);
}
