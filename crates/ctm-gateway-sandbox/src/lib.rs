//! Deterministic in-memory gateway for tests and local runs.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - `external_id` is derived from the submission reference:
//!   `"sbx-cur-{reference}"` / `"sbx-leg-{reference}"`.
//! - Resubmitting a reference is idempotent and returns the original
//!   acceptance, like a real gateway honoring an idempotency handle.
//! - No randomness, no timestamps.
//! - Failures are not spontaneous: tests script them with
//!   [`SandboxGateway::fail_next`], one scripted error per submission.
//! - Webhook deliveries are minted by the test itself via
//!   [`SandboxGateway::webhook_body`] + [`SandboxGateway::sign`]; the
//!   signature scheme is a bare hex HMAC-SHA256 of the body.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use ctm_engine::{
    CreateChargeCall, GatewayAcceptance, GatewayChargeStatus, GatewayClient, GatewayError,
    WebhookNotice,
};
use ctm_schemas::GatewayVariant;

type HmacSha256 = Hmac<Sha256>;

#[derive(Default)]
struct Inner {
    /// reference → (external_id, status label)
    charges: BTreeMap<String, (String, String)>,
    scripted_failures: VecDeque<GatewayError>,
    submissions: u64,
    /// Artificial per-submission delay; lets tests exercise the
    /// orchestrator's timeout path against a "hung" gateway.
    latency: Duration,
}

/// A scriptable stand-in for either gateway variant.
pub struct SandboxGateway {
    variant: GatewayVariant,
    webhook_secret: String,
    inner: Mutex<Inner>,
}

impl SandboxGateway {
    pub fn new(variant: GatewayVariant, webhook_secret: impl Into<String>) -> Self {
        Self {
            variant,
            webhook_secret: webhook_secret.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn current(webhook_secret: impl Into<String>) -> Self {
        Self::new(GatewayVariant::Current, webhook_secret)
    }

    pub fn legacy(webhook_secret: impl Into<String>) -> Self {
        Self::new(GatewayVariant::Legacy, webhook_secret)
    }

    fn prefix(&self) -> &'static str {
        match self.variant {
            GatewayVariant::Current => "sbx-cur",
            GatewayVariant::Legacy => "sbx-leg",
        }
    }

    /// Delay every subsequent submission by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().expect("sandbox lock poisoned").latency = latency;
    }

    /// Queue one error; the next `create_charge` pops and returns it.
    pub fn fail_next(&self, err: GatewayError) {
        self.inner
            .lock()
            .expect("sandbox lock poisoned")
            .scripted_failures
            .push_back(err);
    }

    /// How many submissions actually reached the gateway (scripted
    /// failures included).
    pub fn submission_count(&self) -> u64 {
        self.inner.lock().expect("sandbox lock poisoned").submissions
    }

    /// Flip a stored charge's status (the sandbox's stand-in for
    /// settlement happening on the gateway side).
    pub fn settle(&self, external_id: &str, status: &str) {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        for (ext, stored) in inner.charges.values_mut() {
            if ext.as_str() == external_id {
                *stored = status.to_string();
            }
        }
    }

    /// Deterministic webhook body for a settlement notification.
    pub fn webhook_body(event_id: &str, external_id: &str, status: &str) -> Vec<u8> {
        serde_json::json!({
            "event_id": event_id,
            "external_id": external_id,
            "status": status,
        })
        .to_string()
        .into_bytes()
    }

    /// Sign a payload the way this sandbox's `verify_webhook_signature`
    /// expects.
    pub fn sign(&self, raw_payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(raw_payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

fn map_status(raw: &str) -> GatewayChargeStatus {
    match raw {
        "pending" => GatewayChargeStatus::Pending,
        "paid" => GatewayChargeStatus::Paid,
        "failed" => GatewayChargeStatus::Failed,
        _ => GatewayChargeStatus::Other,
    }
}

#[derive(Debug, Deserialize)]
struct WireWebhook {
    event_id: String,
    external_id: String,
    status: String,
}

#[async_trait]
impl GatewayClient for SandboxGateway {
    fn variant(&self) -> GatewayVariant {
        self.variant
    }

    async fn create_charge(
        &self,
        call: &CreateChargeCall,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let latency = self.inner.lock().expect("sandbox lock poisoned").latency;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        inner.submissions += 1;

        if let Some(err) = inner.scripted_failures.pop_front() {
            return Err(err);
        }

        if let Some((external_id, status)) = inner.charges.get(&call.reference) {
            return Ok(GatewayAcceptance {
                external_id: external_id.clone(),
                status: map_status(status),
            });
        }

        let external_id = format!("{}-{}", self.prefix(), call.reference);
        inner
            .charges
            .insert(call.reference.clone(), (external_id.clone(), "pending".into()));
        Ok(GatewayAcceptance {
            external_id,
            status: GatewayChargeStatus::Pending,
        })
    }

    async fn fetch_status(&self, external_id: &str) -> Result<GatewayChargeStatus, GatewayError> {
        let inner = self.inner.lock().expect("sandbox lock poisoned");
        inner
            .charges
            .values()
            .find(|(ext, _)| ext.as_str() == external_id)
            .map(|(_, status)| map_status(status))
            .ok_or_else(|| GatewayError::Rejected {
                reason: format!("unknown transaction {external_id}"),
            })
    }

    fn verify_webhook_signature(&self, raw_payload: &[u8], signature_header: &str) -> bool {
        let Ok(claimed) = hex::decode(signature_header.trim()) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(raw_payload);
        mac.verify_slice(&claimed).is_ok()
    }

    fn parse_webhook(&self, raw_payload: &[u8]) -> Result<WebhookNotice, GatewayError> {
        let wire: WireWebhook =
            serde_json::from_slice(raw_payload).map_err(|e| GatewayError::MalformedWebhook {
                detail: format!("unparseable payload: {e}"),
            })?;
        if wire.event_id.is_empty() || wire.external_id.is_empty() {
            return Err(GatewayError::MalformedWebhook {
                detail: "event_id and external_id are required".into(),
            });
        }
        Ok(WebhookNotice {
            gateway_event_id: wire.event_id,
            external_id: wire.external_id,
            status: map_status(&wire.status),
            raw_status: wire.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ctm_schemas::{
        BillingType, ChargeItem, Currency, Customer, GatewayAssignment, Money, ProductRef,
    };
    use uuid::Uuid;

    fn call(reference: &str) -> CreateChargeCall {
        CreateChargeCall {
            reference: reference.to_string(),
            customer: Customer {
                customer_id: Uuid::nil(),
                name: "Ada".into(),
                email: "ada@example.com".into(),
                tax_id: "000.000.000-00".into(),
                phone: "+55 11 90000-0000".into(),
                gateway_assignment: GatewayAssignment::Current,
                legacy_external_id: None,
                current_external_id: None,
                created_at_utc: chrono::Utc::now(),
            },
            items: vec![ChargeItem::new(
                ProductRef::new("PMS", 1),
                Money::new(20_000, Currency::Brl),
            )
            .unwrap()],
            billing_type: BillingType::OneTime,
            due_date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_per_reference() {
        let gw = SandboxGateway::current("s3cret");
        let first = gw.create_charge(&call("ref-1")).await.unwrap();
        let second = gw.create_charge(&call("ref-1")).await.unwrap();
        assert_eq!(first.external_id, second.external_id);
        assert_eq!(first.external_id, "sbx-cur-ref-1");
        assert_eq!(gw.submission_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let gw = SandboxGateway::current("s3cret");
        gw.fail_next(GatewayError::Unavailable {
            detail: "scripted".into(),
        });
        assert!(gw.create_charge(&call("ref-1")).await.is_err());
        assert!(gw.create_charge(&call("ref-1")).await.is_ok());
    }

    #[tokio::test]
    async fn minted_webhooks_verify_and_parse() {
        let gw = SandboxGateway::legacy("s3cret");
        let body = SandboxGateway::webhook_body("evt-1", "sbx-leg-x", "paid");
        let sig = gw.sign(&body);

        assert!(gw.verify_webhook_signature(&body, &sig));
        assert!(!gw.verify_webhook_signature(b"other", &sig));

        let notice = gw.parse_webhook(&body).unwrap();
        assert_eq!(notice.gateway_event_id, "evt-1");
        assert_eq!(notice.status, GatewayChargeStatus::Paid);
    }

    #[tokio::test]
    async fn settle_updates_fetch_status() {
        let gw = SandboxGateway::current("s3cret");
        let acc = gw.create_charge(&call("ref-1")).await.unwrap();
        assert_eq!(
            gw.fetch_status(&acc.external_id).await.unwrap(),
            GatewayChargeStatus::Pending
        );
        gw.settle(&acc.external_id, "paid");
        assert_eq!(
            gw.fetch_status(&acc.external_id).await.unwrap(),
            GatewayChargeStatus::Paid
        );
    }
}
