//! In-memory `ChargeStore` with the Postgres store's semantics.
//!
//! One async mutex stands in for the database: every trait method takes
//! the lock once, so each call is atomic exactly like its SQL counterpart
//! (the guarded UPDATE, the deduped insert, the transition + ledger-stamp
//! transaction).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use ctm_engine::{
    ChargeRecord, ChargeState, ChargeStore, CommitOutcome, NewCharge, NewWebhookEvent, StoreError,
    TransitionUpdate, WebhookLedgerEntry,
};
use ctm_schemas::{Customer, GatewayAssignment, GatewayVariant};

#[derive(Default)]
struct Inner {
    charges: HashMap<Uuid, ChargeRecord>,
    by_idempotency: HashMap<String, Uuid>,
    webhook_events: HashMap<(GatewayVariant, String), WebhookLedgerEntry>,
    customers: HashMap<Uuid, Customer>,
    migration_log: Vec<(Uuid, GatewayAssignment, GatewayAssignment)>,
}

#[derive(Default)]
pub struct MemoryChargeStore {
    inner: Mutex<Inner>,
}

impl MemoryChargeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_customer(&self, customer: Customer) {
        self.inner
            .lock()
            .await
            .customers
            .insert(customer.customer_id, customer);
    }

    pub async fn charge_count(&self) -> usize {
        self.inner.lock().await.charges.len()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.inner.lock().await.webhook_events.len()
    }

    pub async fn migration_log(&self) -> Vec<(Uuid, GatewayAssignment, GatewayAssignment)> {
        self.inner.lock().await.migration_log.clone()
    }

    fn apply_update(record: &mut ChargeRecord, update: &TransitionUpdate) {
        record.status = update.next;
        if record.external_id.is_none() {
            record.external_id = update.set_external_id.clone();
        }
        if update.bump_retry {
            record.retry_count += 1;
        }
        record.updated_at_utc = Utc::now();
    }

    fn guarded_commit(inner: &mut Inner, update: &TransitionUpdate) -> Result<CommitOutcome, StoreError> {
        let record = inner
            .charges
            .get_mut(&update.charge_id)
            .ok_or(StoreError::ChargeNotFound {
                charge_id: update.charge_id,
            })?;
        if record.status != update.expected {
            return Ok(CommitOutcome::Conflict {
                actual: record.status,
            });
        }
        Self::apply_update(record, update);
        Ok(CommitOutcome::Applied(record.clone()))
    }
}

#[async_trait]
impl ChargeStore for MemoryChargeStore {
    async fn insert_charge(&self, new: NewCharge) -> Result<ChargeRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.by_idempotency.contains_key(&new.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey {
                key: new.idempotency_key,
            });
        }
        let now = Utc::now();
        let record = ChargeRecord {
            charge_id: new.charge_id,
            customer_id: new.customer_id,
            billing_type: new.billing_type,
            status: ChargeState::Created,
            gateway_used: new.gateway_used,
            external_id: None,
            due_date: new.due_date,
            idempotency_key: new.idempotency_key.clone(),
            currency: new.currency,
            retry_count: 0,
            items: new.items,
            created_at_utc: now,
            updated_at_utc: now,
        };
        inner
            .by_idempotency
            .insert(new.idempotency_key, new.charge_id);
        inner.charges.insert(new.charge_id, record.clone());
        Ok(record)
    }

    async fn fetch_charge(&self, charge_id: Uuid) -> Result<Option<ChargeRecord>, StoreError> {
        Ok(self.inner.lock().await.charges.get(&charge_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ChargeRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_idempotency
            .get(key)
            .and_then(|id| inner.charges.get(id))
            .cloned())
    }

    async fn find_by_external_id(
        &self,
        gateway: GatewayVariant,
        external_id: &str,
    ) -> Result<Option<ChargeRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .charges
            .values()
            .find(|c| {
                c.gateway_used == gateway && c.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn commit_transition(
        &self,
        update: TransitionUpdate,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        Self::guarded_commit(&mut inner, &update)
    }

    async fn webhook_event(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<Option<WebhookLedgerEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .webhook_events
            .get(&(gateway, gateway_event_id.to_string()))
            .cloned())
    }

    async fn record_webhook_received(&self, ev: NewWebhookEvent) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (ev.gateway, ev.gateway_event_id.clone());
        if inner.webhook_events.contains_key(&key) {
            return Ok(false);
        }
        inner.webhook_events.insert(
            key,
            WebhookLedgerEntry {
                gateway: ev.gateway,
                gateway_event_id: ev.gateway_event_id,
                charge_id: ev.charge_id,
                received_status: ev.received_status,
                received_at_utc: Utc::now(),
                processed_at_utc: None,
            },
        );
        Ok(true)
    }

    async fn commit_webhook_transition(
        &self,
        update: TransitionUpdate,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let outcome = Self::guarded_commit(&mut inner, &update)?;
        if matches!(outcome, CommitOutcome::Applied(_)) {
            if let Some(entry) = inner
                .webhook_events
                .get_mut(&(gateway, gateway_event_id.to_string()))
            {
                entry.processed_at_utc.get_or_insert_with(Utc::now);
            }
        }
        Ok(outcome)
    }

    async fn mark_webhook_processed(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner
            .webhook_events
            .get_mut(&(gateway, gateway_event_id.to_string()))
        {
            entry.processed_at_utc.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn fetch_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.inner.lock().await.customers.get(&customer_id).cloned())
    }

    async fn set_gateway_assignment(
        &self,
        customer_id: Uuid,
        from: GatewayAssignment,
        to: GatewayAssignment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let customer = inner
            .customers
            .get_mut(&customer_id)
            .ok_or(StoreError::CustomerNotFound { customer_id })?;
        customer.gateway_assignment = to;
        inner.migration_log.push((customer_id, from, to));
        Ok(())
    }

    async fn count_open_charges_on(
        &self,
        customer_id: Uuid,
        gateway: GatewayVariant,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .charges
            .values()
            .filter(|c| {
                c.customer_id == customer_id
                    && c.gateway_used == gateway
                    && !c.status.is_terminal()
            })
            .count() as i64)
    }
}
