//! Charge orchestration.
//!
//! The orchestrator owns the only path by which a charge reaches PENDING
//! and the only writer of `external_id`. It composes four seams: the
//! [`ChargeStore`], the [`ProductCatalog`], the [`GatewayRouting`] decision
//! (implemented by the migration coordinator), and the [`GatewaySet`].
//!
//! # Submission is cancellation-proof
//!
//! The gateway call and its follow-up commit run on a spawned task. An HTTP
//! caller that abandons the response future therefore cannot cancel an
//! in-flight gateway submission half-way: whatever the gateway decided is
//! still recorded. On timeout the outcome is treated as unknown and the
//! charge stays CREATED — never assumed successful — so the same
//! idempotency key is safe to resubmit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BillingError;
use crate::gateway::{CreateChargeCall, GatewayError, GatewaySet};
use crate::state_machine::{transition, ChargeEvent, ChargeState, TransitionError, DEFAULT_MAX_RETRIES};
use crate::store::{ChargeRecord, ChargeStore, CommitOutcome, NewCharge, StoreError, TransitionUpdate};
use ctm_schemas::{total_of, BillingType, ChargeItem, Customer, DueDate, GatewayVariant, ProductRef};

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Read-only product existence check, backed by the product-owning service.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn exists(&self, product: &ProductRef) -> Result<bool, anyhow::Error>;
}

/// Which gateway a customer's *new* charges go to. Implemented by the
/// migration coordinator; CURRENT and DUAL assignments route to CURRENT.
#[async_trait]
pub trait GatewayRouting: Send + Sync {
    async fn route_for(&self, customer_id: Uuid) -> Result<GatewayVariant, BillingError>;
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Operational bounds for the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorLimits {
    /// Upper bound on one gateway submission; past it the outcome is
    /// unknown and the charge stays resubmittable.
    pub gateway_timeout: Duration,
    /// Bounded attempts for a status-guarded commit that loses its race.
    pub commit_attempts: u32,
    /// Retry budget for failed charges.
    pub max_retries: i32,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            commit_attempts: 3,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateChargeRequest {
    pub customer_id: Uuid,
    pub items: Vec<ChargeItem>,
    pub billing_type: BillingType,
    pub due_date: DueDate,
    pub idempotency_key: String,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ChargeStore>,
    catalog: Arc<dyn ProductCatalog>,
    routing: Arc<dyn GatewayRouting>,
    gateways: GatewaySet,
    limits: OrchestratorLimits,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChargeStore>,
        catalog: Arc<dyn ProductCatalog>,
        routing: Arc<dyn GatewayRouting>,
        gateways: GatewaySet,
        limits: OrchestratorLimits,
    ) -> Self {
        Self {
            store,
            catalog,
            routing,
            gateways,
            limits,
        }
    }

    pub fn limits(&self) -> OrchestratorLimits {
        self.limits
    }

    /// Create (or resume) a charge.
    ///
    /// The idempotency race is closed by the store's unique constraint:
    /// concurrent duplicates resolve to exactly one inserted row, and every
    /// loser either resumes it (still CREATED — an earlier attempt died
    /// before the gateway answered) or receives `DuplicateRequest`.
    pub async fn create_charge(
        &self,
        req: CreateChargeRequest,
    ) -> Result<ChargeRecord, BillingError> {
        if req.idempotency_key.trim().is_empty() {
            return Err(BillingError::Validation(
                "idempotency_key must not be empty".into(),
            ));
        }
        let total =
            total_of(&req.items).map_err(|e| BillingError::Validation(e.to_string()))?;
        for item in &req.items {
            let known = self
                .catalog
                .exists(&item.product)
                .await
                .map_err(StoreError::Backend)?;
            if !known {
                return Err(BillingError::Validation(format!(
                    "unknown product {}",
                    item.product
                )));
            }
        }

        let customer = self
            .store
            .fetch_customer(req.customer_id)
            .await?
            .ok_or(BillingError::UnknownCustomer {
                customer_id: req.customer_id,
            })?;
        let gateway_used = self.routing.route_for(customer.customer_id).await?;

        let new = NewCharge {
            charge_id: Uuid::new_v4(),
            customer_id: customer.customer_id,
            billing_type: req.billing_type,
            gateway_used,
            due_date: req.due_date,
            idempotency_key: req.idempotency_key.clone(),
            currency: total.currency(),
            items: req.items.clone(),
        };

        let charge = match self.store.insert_charge(new).await {
            Ok(charge) => {
                info!(
                    charge_id = %charge.charge_id,
                    customer_id = %charge.customer_id,
                    gateway = %charge.gateway_used,
                    total = %charge.total_amount(),
                    "charge created"
                );
                charge
            }
            Err(StoreError::DuplicateIdempotencyKey { key }) => {
                let existing = self
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Backend(anyhow::anyhow!(
                            "idempotency key {key:?} bound but charge not found"
                        ))
                    })?;
                if existing.status != ChargeState::Created
                    || existing.total_amount().minor_units() != total.minor_units()
                {
                    return Err(BillingError::DuplicateRequest {
                        charge_id: existing.charge_id,
                        idempotency_key: key,
                    });
                }
                info!(charge_id = %existing.charge_id, "resuming CREATED charge for resubmitted key");
                existing
            }
            Err(err) => return Err(err.into()),
        };

        self.submit_for_acceptance(charge, customer).await
    }

    /// Drive the FAILED → RETRYING → PENDING path for one charge.
    ///
    /// A spent retry budget moves the charge to DEAD and surfaces
    /// `RetriesExhausted`. A charge already in RETRYING (a previous retry
    /// died before the gateway answered) is resumed without burning
    /// another retry.
    pub async fn retry_charge(&self, charge_id: Uuid) -> Result<ChargeRecord, BillingError> {
        let charge = self
            .store
            .fetch_charge(charge_id)
            .await?
            .ok_or(BillingError::ChargeNotFound { charge_id })?;
        let customer = self
            .store
            .fetch_customer(charge.customer_id)
            .await?
            .ok_or(BillingError::UnknownCustomer {
                customer_id: charge.customer_id,
            })?;

        let charge = match charge.status {
            ChargeState::Retrying => charge,
            ChargeState::Failed => {
                if charge.retry_count >= self.limits.max_retries {
                    apply_event(
                        self.store.as_ref(),
                        charge_id,
                        ChargeEvent::RetryExhausted,
                        None,
                        self.limits,
                    )
                    .await?;
                    warn!(%charge_id, "retry budget spent; charge moved to DEAD");
                    return Err(BillingError::RetriesExhausted { charge_id });
                }
                apply_event(
                    self.store.as_ref(),
                    charge_id,
                    ChargeEvent::RetryRequested,
                    None,
                    self.limits,
                )
                .await?
            }
            from => {
                return Err(BillingError::InvalidTransition(TransitionError {
                    from,
                    event: ChargeEvent::RetryRequested.as_str(),
                }))
            }
        };

        self.submit_for_acceptance(charge, customer).await
    }

    pub async fn get_charge(&self, charge_id: Uuid) -> Result<ChargeRecord, BillingError> {
        self.store
            .fetch_charge(charge_id)
            .await?
            .ok_or(BillingError::ChargeNotFound { charge_id })
    }

    /// Submit a CREATED or RETRYING charge to its gateway and commit the
    /// outcome. Runs detached; see the module docs.
    async fn submit_for_acceptance(
        &self,
        charge: ChargeRecord,
        customer: Customer,
    ) -> Result<ChargeRecord, BillingError> {
        let gateway = Arc::clone(self.gateways.select(charge.gateway_used));
        let store = Arc::clone(&self.store);
        let limits = self.limits;
        let charge_id = charge.charge_id;
        let submitted_from = charge.status;
        let call = CreateChargeCall {
            reference: charge.charge_id.to_string(),
            customer,
            items: charge.items.clone(),
            billing_type: charge.billing_type,
            due_date: charge.due_date,
        };

        let task = tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(limits.gateway_timeout, gateway.create_charge(&call)).await;
            match outcome {
                Err(_) => {
                    warn!(%charge_id, "gateway submission timed out; outcome unknown, charge left resubmittable");
                    Err(BillingError::GatewayUnavailable {
                        detail: format!("submission timed out after {:?}", limits.gateway_timeout),
                    })
                }
                Ok(Err(GatewayError::Rejected { reason })) => {
                    // Only CREATED has a rejection edge; a rejected retry
                    // leaves the charge in RETRYING, re-drivable.
                    if submitted_from == ChargeState::Created {
                        apply_event(
                            store.as_ref(),
                            charge_id,
                            ChargeEvent::GatewayRejected,
                            None,
                            limits,
                        )
                        .await?;
                    }
                    warn!(%charge_id, %reason, "gateway rejected charge");
                    Err(BillingError::GatewayRejected { reason })
                }
                Ok(Err(err)) => Err(BillingError::from_gateway(err)),
                Ok(Ok(acceptance)) => {
                    let record = apply_event(
                        store.as_ref(),
                        charge_id,
                        ChargeEvent::GatewayAccepted,
                        Some(acceptance.external_id),
                        limits,
                    )
                    .await?;
                    info!(%charge_id, external_id = ?record.external_id, "charge pending settlement");
                    Ok(record)
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                // The task panicked or was aborted: the outcome is unknown,
                // which maps to the same retryable contract as a timeout.
                warn!(%charge_id, error = %err, "submission task failed; outcome unknown");
                Err(BillingError::GatewayUnavailable {
                    detail: "submission task failed; outcome unknown".into(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Guarded event application
// ---------------------------------------------------------------------------

/// Apply one state-machine event through the store's guarded commit,
/// retrying a bounded number of times when a concurrent writer wins the
/// race. Each retry re-reads the charge and re-runs the transition table
/// from the fresh state; an event that is no longer legal surfaces
/// `InvalidTransition`.
pub(crate) async fn apply_event(
    store: &dyn ChargeStore,
    charge_id: Uuid,
    event: ChargeEvent,
    set_external_id: Option<String>,
    limits: OrchestratorLimits,
) -> Result<ChargeRecord, BillingError> {
    let mut charge = store
        .fetch_charge(charge_id)
        .await?
        .ok_or(BillingError::ChargeNotFound { charge_id })?;

    for attempt in 0..limits.commit_attempts {
        let next = transition(charge.status, event, charge.retry_count, limits.max_retries)?;
        let update = TransitionUpdate {
            charge_id,
            expected: charge.status,
            next,
            set_external_id: set_external_id.clone(),
            bump_retry: matches!(event, ChargeEvent::RetryRequested),
        };
        match store.commit_transition(update).await? {
            CommitOutcome::Applied(record) => return Ok(record),
            CommitOutcome::Conflict { actual } => {
                warn!(
                    %charge_id,
                    expected = %charge.status,
                    found = %actual,
                    attempt,
                    "transition commit lost its race; re-reading"
                );
                if actual == next {
                    // A concurrent writer applied this very effect (e.g.
                    // two resumes of the same idempotent submission).
                    return store
                        .fetch_charge(charge_id)
                        .await?
                        .ok_or(BillingError::ChargeNotFound { charge_id });
                }
                tokio::time::sleep(Duration::from_millis(20 * (attempt as u64 + 1))).await;
                charge = store
                    .fetch_charge(charge_id)
                    .await?
                    .ok_or(BillingError::ChargeNotFound { charge_id })?;
            }
        }
    }

    Err(BillingError::Conflict { charge_id })
}
