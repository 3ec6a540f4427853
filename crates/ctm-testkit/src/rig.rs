//! Full-stack wiring with deterministic defaults.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use ctm_audit::AuditWriter;
use ctm_engine::{
    CreateChargeRequest, GatewaySet, Orchestrator, OrchestratorLimits, ProductCatalog,
};
use ctm_gateway_sandbox::SandboxGateway;
use ctm_migration::MigrationCoordinator;
use ctm_reconcile::{ReconcilerLimits, WebhookReconciler};
use ctm_schemas::{
    BillingType, ChargeItem, Currency, Customer, GatewayAssignment, Money, ProductRef,
};

use crate::memory::MemoryChargeStore;

/// Catalog stub: either a fixed allow-list or allow-everything.
pub struct StaticCatalog {
    known: Option<HashSet<(String, i64)>>,
}

impl StaticCatalog {
    pub fn allow_all() -> Self {
        Self { known: None }
    }

    pub fn allowing(products: impl IntoIterator<Item = (&'static str, i64)>) -> Self {
        Self {
            known: Some(
                products
                    .into_iter()
                    .map(|(t, id)| (t.to_string(), id))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ProductCatalog for StaticCatalog {
    async fn exists(&self, product: &ProductRef) -> Result<bool, anyhow::Error> {
        Ok(match &self.known {
            None => true,
            Some(set) => set.contains(&(product.product_type.clone(), product.product_id)),
        })
    }
}

/// The whole billing stack on in-memory parts.
pub struct BillingRig {
    pub store: Arc<MemoryChargeStore>,
    pub current: Arc<SandboxGateway>,
    pub legacy: Arc<SandboxGateway>,
    pub gateways: GatewaySet,
    pub orchestrator: Orchestrator,
    pub reconciler: WebhookReconciler,
    pub migrations: MigrationCoordinator,
    pub audit_path: std::path::PathBuf,
    // Held so the audit log's directory outlives the rig.
    _audit_dir: tempfile::TempDir,
}

impl BillingRig {
    pub fn new() -> Self {
        Self::with_limits(OrchestratorLimits {
            // Short timeout keeps outage scenarios fast.
            gateway_timeout: Duration::from_millis(500),
            ..OrchestratorLimits::default()
        })
    }

    pub fn with_limits(limits: OrchestratorLimits) -> Self {
        let store = Arc::new(MemoryChargeStore::new());
        let current = Arc::new(SandboxGateway::current("rig-current-secret"));
        let legacy = Arc::new(SandboxGateway::legacy("rig-legacy-secret"));
        let gateways = GatewaySet::new(
            Arc::clone(&current) as _,
            Arc::clone(&legacy) as _,
        );

        let audit_dir = tempfile::tempdir().expect("create audit tempdir");
        let audit_path = audit_dir.path().join("migrations.jsonl");
        let audit = AuditWriter::new(&audit_path, true).expect("create audit writer");

        let migrations = MigrationCoordinator::new(Arc::clone(&store) as _, audit);
        let orchestrator = Orchestrator::new(
            Arc::clone(&store) as _,
            Arc::new(StaticCatalog::allowing([("PMS", 1), ("Motor", 2)])),
            Arc::new(migrations.clone()),
            gateways.clone(),
            limits,
        );
        let reconciler = WebhookReconciler::new(
            Arc::clone(&store) as _,
            gateways.clone(),
            ReconcilerLimits {
                max_retries: limits.max_retries,
                ..ReconcilerLimits::default()
            },
        );

        Self {
            store,
            current,
            legacy,
            gateways,
            orchestrator,
            reconciler,
            migrations,
            audit_path,
            _audit_dir: audit_dir,
        }
    }

    /// Register a customer with the given assignment and return it.
    pub async fn add_customer(&self, assignment: GatewayAssignment) -> Customer {
        let customer = Customer {
            customer_id: Uuid::new_v4(),
            name: "Rig Customer".into(),
            email: "rig@example.com".into(),
            tax_id: "123.456.789-00".into(),
            phone: "+55 11 91234-5678".into(),
            gateway_assignment: assignment,
            legacy_external_id: None,
            current_external_id: None,
            created_at_utc: Utc::now(),
        };
        self.store.add_customer(customer.clone()).await;
        customer
    }

    /// The canonical two-item request: PMS/1 at 20 000 + Motor/2 at 5 000,
    /// recurring, total 25 000 minor units.
    pub fn request(customer_id: Uuid, idempotency_key: &str) -> CreateChargeRequest {
        CreateChargeRequest {
            customer_id,
            items: vec![
                ChargeItem::new(ProductRef::new("PMS", 1), Money::new(20_000, Currency::Brl))
                    .expect("positive amount"),
                ChargeItem::new(ProductRef::new("Motor", 2), Money::new(5_000, Currency::Brl))
                    .expect("positive amount"),
            ],
            billing_type: BillingType::Recurring,
            due_date: NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date"),
            idempotency_key: idempotency_key.to_string(),
        }
    }
}

impl Default for BillingRig {
    fn default() -> Self {
        Self::new()
    }
}
