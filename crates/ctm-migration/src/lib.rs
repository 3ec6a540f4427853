//! Per-customer gateway migration.
//!
//! [`MigrationCoordinator`] owns the `gateway_assignment` field: nothing
//! else mutates it. Assignment changes append a migration-log row in the
//! store (same transaction as the flip) and a hash-chained audit event,
//! giving compliance a tamper-evident trail.
//!
//! Routing contract ([`GatewayRouting`]): CURRENT and DUAL route new
//! charges to the current gateway; only LEGACY routes to the legacy one.
//! The dual window therefore affects webhook acceptance for historical
//! charges, never new-charge placement.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use ctm_audit::AuditWriter;
use ctm_engine::{BillingError, ChargeStore, GatewayRouting};
use ctm_schemas::{Customer, GatewayAssignment, GatewayVariant};

#[derive(Clone)]
pub struct MigrationCoordinator {
    store: Arc<dyn ChargeStore>,
    audit: Arc<Mutex<AuditWriter>>,
}

impl MigrationCoordinator {
    pub fn new(store: Arc<dyn ChargeStore>, audit: AuditWriter) -> Self {
        Self {
            store,
            audit: Arc::new(Mutex::new(audit)),
        }
    }

    /// Park a customer on the legacy gateway (not yet migrated, or a
    /// rollback out of a dual window). Allowed from any assignment.
    pub async fn mark_legacy(&self, customer_id: Uuid) -> Result<Customer, BillingError> {
        let customer = self.fetch(customer_id).await?;
        self.flip(customer, GatewayAssignment::Legacy, "migration.mark_legacy")
            .await
    }

    /// Open the dual-gateway window: both gateways' webhooks stay valid
    /// for their own historical charges, new charges route to CURRENT.
    /// Only legal from LEGACY.
    pub async fn begin_dual(&self, customer_id: Uuid) -> Result<Customer, BillingError> {
        let customer = self.fetch(customer_id).await?;
        if customer.gateway_assignment != GatewayAssignment::Legacy {
            return Err(BillingError::Validation(format!(
                "customer {customer_id} is {}, begin_dual requires LEGACY",
                customer.gateway_assignment
            )));
        }
        self.flip(customer, GatewayAssignment::Dual, "migration.begin_dual")
            .await
    }

    /// Close the migration: only legal from DUAL, and only once every
    /// legacy charge has reached a terminal state.
    pub async fn complete_migration(&self, customer_id: Uuid) -> Result<Customer, BillingError> {
        let customer = self.fetch(customer_id).await?;
        if customer.gateway_assignment != GatewayAssignment::Dual {
            return Err(BillingError::Validation(format!(
                "customer {customer_id} is {}, complete_migration requires DUAL",
                customer.gateway_assignment
            )));
        }

        let open_charges = self
            .store
            .count_open_charges_on(customer_id, GatewayVariant::Legacy)
            .await?;
        if open_charges > 0 {
            warn!(%customer_id, open_charges, "migration completion blocked");
            return Err(BillingError::MigrationIncomplete {
                customer_id,
                open_charges,
            });
        }

        self.flip(customer, GatewayAssignment::Current, "migration.complete")
            .await
    }

    async fn fetch(&self, customer_id: Uuid) -> Result<Customer, BillingError> {
        self.store
            .fetch_customer(customer_id)
            .await?
            .ok_or(BillingError::UnknownCustomer { customer_id })
    }

    /// Commit the assignment flip (store writes the migration-log row in
    /// the same transaction) and append the audit event.
    async fn flip(
        &self,
        customer: Customer,
        to: GatewayAssignment,
        action: &str,
    ) -> Result<Customer, BillingError> {
        let from = customer.gateway_assignment;
        let customer_id = customer.customer_id;

        self.store
            .set_gateway_assignment(customer_id, from, to)
            .await?;

        {
            let mut audit = self.audit.lock().await;
            audit
                .append(
                    customer_id,
                    action,
                    json!({ "from": from.as_str(), "to": to.as_str() }),
                )
                .map_err(ctm_engine::StoreError::Backend)?;
        }

        info!(%customer_id, %from, %to, action, "gateway assignment changed");

        Ok(Customer {
            gateway_assignment: to,
            ..customer
        })
    }
}

#[async_trait]
impl GatewayRouting for MigrationCoordinator {
    async fn route_for(&self, customer_id: Uuid) -> Result<GatewayVariant, BillingError> {
        let customer = self.fetch(customer_id).await?;
        Ok(customer.gateway_assignment.routes_to())
    }
}
