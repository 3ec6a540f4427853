//! Webhook reconciliation pipeline.
//!
//! Gateways deliver settlement notifications at-least-once, unordered, and
//! unauthenticated beyond an HMAC header. [`WebhookReconciler`] turns that
//! channel into exactly-once financial-state transitions:
//!
//! 1. **Verify** the signature with the delivering gateway's client;
//!    fail closed.
//! 2. **Parse** the payload into a [`WebhookNotice`].
//! 3. **Dedupe** against the webhook ledger: an event whose ledger row is
//!    already `processed_at`-stamped is acknowledged without reapplying.
//! 4. **Resolve** the charge by `(gateway, external_id)`; a miss is
//!    retryable (it may race the charge-creation commit).
//! 5. **Transition** through the same status-guarded commit path the
//!    orchestrator uses; the ledger stamp lands in the same transaction.
//!
//! Out-of-order deliveries (a FAILED event after PAID was recorded) hit
//! the terminal-state wall of the transition table, are logged, stamped
//! processed, and acknowledged — a stale duplicate never re-fails a paid
//! charge.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use ctm_engine::{
    transition, BillingError, ChargeEvent, ChargeRecord, ChargeState, ChargeStore, CommitOutcome,
    GatewayChargeStatus, GatewaySet, NewWebhookEvent, TransitionUpdate, DEFAULT_MAX_RETRIES,
};
use ctm_schemas::GatewayVariant;

// ---------------------------------------------------------------------------
// Limits / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerLimits {
    /// Bounded attempts when the guarded commit loses to a concurrent
    /// writer on the same charge.
    pub commit_attempts: u32,
    /// Mirrors the orchestrator's retry budget; needed by the transition
    /// table's guarded edge.
    pub max_retries: i32,
}

impl Default for ReconcilerLimits {
    fn default() -> Self {
        Self {
            commit_attempts: 3,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What handling one delivery amounted to. Every variant is an
/// acknowledgeable success at the HTTP layer.
#[derive(Debug)]
pub enum WebhookOutcome {
    /// The event moved the charge; the fresh record is attached.
    Applied { charge: ChargeRecord },
    /// Redelivery of an already-processed event. No effect.
    Duplicate,
    /// The event was not legal from the charge's current state
    /// (stale/out-of-order). Acknowledged, no effect.
    OutOfOrder { from: ChargeState },
    /// The gateway reported a status that maps to no transition event
    /// (intermediate chatter). Acknowledged, no effect.
    Ignored { raw_status: String },
}

// ---------------------------------------------------------------------------
// WebhookReconciler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn ChargeStore>,
    gateways: GatewaySet,
    limits: ReconcilerLimits,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn ChargeStore>, gateways: GatewaySet, limits: ReconcilerLimits) -> Self {
        Self {
            store,
            gateways,
            limits,
        }
    }

    /// Handle one raw webhook delivery from `variant`.
    ///
    /// # Errors
    /// - [`BillingError::SignatureInvalid`] — verification failed; reject,
    ///   no state change.
    /// - [`BillingError::MalformedWebhook`] — required fields absent.
    /// - [`BillingError::UnknownCharge`] — no charge carries this
    ///   transaction id on this gateway; the HTTP layer answers retryable.
    pub async fn handle_webhook(
        &self,
        variant: GatewayVariant,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, BillingError> {
        let gateway = self.gateways.select(variant);

        if !gateway.verify_webhook_signature(raw_payload, signature_header) {
            warn!(gateway = %variant, "webhook signature rejected");
            return Err(BillingError::SignatureInvalid);
        }

        let notice = gateway
            .parse_webhook(raw_payload)
            .map_err(BillingError::from_gateway)?;

        // Dedup ledger first: a processed event is done regardless of what
        // the charge looks like now.
        if let Some(entry) = self
            .store
            .webhook_event(variant, &notice.gateway_event_id)
            .await?
        {
            if entry.processed_at_utc.is_some() {
                info!(
                    gateway = %variant,
                    event_id = %notice.gateway_event_id,
                    "duplicate webhook delivery acknowledged"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            // Recorded but unprocessed: an earlier delivery died between
            // ledger insert and commit. Fall through and finish the job.
        }

        let charge = self
            .store
            .find_by_external_id(variant, &notice.external_id)
            .await?
            .ok_or_else(|| BillingError::UnknownCharge {
                gateway: variant,
                external_id: notice.external_id.clone(),
            })?;

        // First sighting: ledger row without a processed stamp. Deduped by
        // constraint, so a concurrent delivery of the same event cannot
        // create a second row.
        self.store
            .record_webhook_received(NewWebhookEvent {
                gateway: variant,
                gateway_event_id: notice.gateway_event_id.clone(),
                charge_id: charge.charge_id,
                received_status: notice.raw_status.clone(),
            })
            .await?;

        let event = match notice.status {
            GatewayChargeStatus::Paid => ChargeEvent::WebhookPaid,
            GatewayChargeStatus::Failed => ChargeEvent::WebhookFailed,
            GatewayChargeStatus::Pending | GatewayChargeStatus::Other => {
                self.store
                    .mark_webhook_processed(variant, &notice.gateway_event_id)
                    .await?;
                info!(
                    gateway = %variant,
                    event_id = %notice.gateway_event_id,
                    raw_status = %notice.raw_status,
                    "webhook status carries no transition; acknowledged"
                );
                return Ok(WebhookOutcome::Ignored {
                    raw_status: notice.raw_status,
                });
            }
        };

        self.apply(variant, &notice.gateway_event_id, charge, event).await
    }

    /// Apply the mapped event through the guarded commit, stamping the
    /// ledger row in the same transaction. Bounded retry on lost races;
    /// an event that becomes illegal after a re-read is acknowledged as
    /// out-of-order.
    async fn apply(
        &self,
        variant: GatewayVariant,
        gateway_event_id: &str,
        mut charge: ChargeRecord,
        event: ChargeEvent,
    ) -> Result<WebhookOutcome, BillingError> {
        for attempt in 0..self.limits.commit_attempts {
            let next = match transition(
                charge.status,
                event,
                charge.retry_count,
                self.limits.max_retries,
            ) {
                Ok(next) => next,
                Err(err) => {
                    warn!(
                        charge_id = %charge.charge_id,
                        from = %err.from,
                        event = err.event,
                        "out-of-order webhook dropped; stored state is authoritative"
                    );
                    self.store
                        .mark_webhook_processed(variant, gateway_event_id)
                        .await?;
                    return Ok(WebhookOutcome::OutOfOrder { from: err.from });
                }
            };

            let update = TransitionUpdate {
                charge_id: charge.charge_id,
                expected: charge.status,
                next,
                set_external_id: None,
                bump_retry: false,
            };
            match self
                .store
                .commit_webhook_transition(update, variant, gateway_event_id)
                .await?
            {
                CommitOutcome::Applied(record) => {
                    info!(
                        charge_id = %record.charge_id,
                        status = %record.status,
                        event_id = %gateway_event_id,
                        "webhook applied"
                    );
                    return Ok(WebhookOutcome::Applied { charge: record });
                }
                CommitOutcome::Conflict { actual } => {
                    warn!(
                        charge_id = %charge.charge_id,
                        expected = %charge.status,
                        found = %actual,
                        attempt,
                        "webhook commit lost its race; re-reading"
                    );
                    tokio::time::sleep(Duration::from_millis(20 * (attempt as u64 + 1))).await;
                    charge = self
                        .store
                        .fetch_charge(charge.charge_id)
                        .await?
                        .ok_or(BillingError::ChargeNotFound {
                            charge_id: charge.charge_id,
                        })?;
                }
            }
        }

        Err(BillingError::Conflict {
            charge_id: charge.charge_id,
        })
    }
}
