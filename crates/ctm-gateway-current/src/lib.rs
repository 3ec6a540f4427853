//! HTTP adapter for the CURRENT payment gateway.
//!
//! Wire protocol: JSON REST under `/v1`, `Authorization: Bearer <key>`.
//! Webhooks are signed Stripe-style: the `Gateway-Signature` header carries
//! `t=<unix>,v1=<hex hmac-sha256>` where the MAC covers `"{t}.{body}"`.
//! Verification is constant-time (`Mac::verify_slice`) and rejects
//! timestamps older than the tolerance window, closing replay of captured
//! deliveries.
//!
//! The client is a plain value holding its own credentials; CURRENT and
//! LEGACY instances coexist without any process-wide configuration.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use ctm_engine::{
    CreateChargeCall, GatewayAcceptance, GatewayChargeStatus, GatewayClient, GatewayError,
    WebhookNotice,
};
use ctm_schemas::{BillingType, GatewayVariant};

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the gateway's signature timestamp and ours.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Config / client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CurrentGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub request_timeout: Duration,
}

pub struct CurrentGatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    webhook_secret: String,
}

impl CurrentGatewayClient {
    pub fn new(cfg: CurrentGatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable {
                detail: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            webhook_secret: cfg.webhook_secret,
        })
    }

    fn map_response_error(status: reqwest::StatusCode, body: &str) -> GatewayError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return GatewayError::Auth {
                detail: format!("gateway answered {status}"),
            };
        }
        if status.is_server_error() {
            return GatewayError::Unavailable {
                detail: format!("gateway answered {status}"),
            };
        }
        // Remaining 4xx: permanent rejection; surface the gateway's reason
        // code when the body carries one.
        let reason = serde_json::from_str::<WireError>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| format!("http {status}"));
        GatewayError::Rejected { reason }
    }

    fn map_transport_error(err: reqwest::Error) -> GatewayError {
        GatewayError::Unavailable {
            detail: format!("transport: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireCreateCharge<'a> {
    reference: &'a str,
    customer: WireCustomer<'a>,
    billing: &'static str,
    due_date: String,
    currency: &'static str,
    line_items: Vec<WireLineItem>,
}

#[derive(Debug, Serialize)]
struct WireCustomer<'a> {
    name: &'a str,
    email: &'a str,
    tax_id: &'a str,
    phone: &'a str,
}

#[derive(Debug, Serialize)]
struct WireLineItem {
    description: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct WireCharge {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct WireWebhook {
    event_id: String,
    data: WireWebhookData,
}

#[derive(Debug, Deserialize)]
struct WireWebhookData {
    charge_id: String,
    status: String,
}

fn map_status(raw: &str) -> GatewayChargeStatus {
    match raw {
        "pending" | "processing" => GatewayChargeStatus::Pending,
        "paid" | "confirmed" => GatewayChargeStatus::Paid,
        "failed" | "refused" | "charged_back" => GatewayChargeStatus::Failed,
        _ => GatewayChargeStatus::Other,
    }
}

fn billing_label(billing: BillingType) -> &'static str {
    match billing {
        BillingType::OneTime => "one_time",
        BillingType::Recurring => "recurring",
    }
}

// ---------------------------------------------------------------------------
// Signature scheme
// ---------------------------------------------------------------------------

/// Compute the `t=…,v1=…` header value for a payload. Exposed so tests and
/// the sandbox tooling can mint valid deliveries.
pub fn sign_payload(secret: &str, timestamp: i64, raw_payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(secret: &str, raw_payload: &[u8], signature_header: &str, now: i64) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<&str> = None;
    for part in signature_header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value),
            _ => {}
        }
    }
    let (Some(timestamp), Some(v1)) = (timestamp, v1) else {
        return false;
    };
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return false;
    }
    let Ok(claimed) = hex::decode(v1) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_payload);
    mac.verify_slice(&claimed).is_ok()
}

// ---------------------------------------------------------------------------
// GatewayClient impl
// ---------------------------------------------------------------------------

#[async_trait]
impl GatewayClient for CurrentGatewayClient {
    fn variant(&self) -> GatewayVariant {
        GatewayVariant::Current
    }

    async fn create_charge(
        &self,
        call: &CreateChargeCall,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let body = WireCreateCharge {
            reference: &call.reference,
            customer: WireCustomer {
                name: &call.customer.name,
                email: &call.customer.email,
                tax_id: &call.customer.tax_id,
                phone: &call.customer.phone,
            },
            billing: billing_label(call.billing_type),
            due_date: call.due_date.to_string(),
            currency: call
                .items
                .first()
                .map(|i| i.amount.currency().as_str())
                .unwrap_or("BRL"),
            line_items: call
                .items
                .iter()
                .map(|i| WireLineItem {
                    description: i.product.to_string(),
                    amount: i.amount.minor_units(),
                })
                .collect(),
        };

        let resp = self
            .http
            .post(format!("{}/v1/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_transport_error)?;
        if !status.is_success() {
            return Err(Self::map_response_error(status, &text));
        }

        let charge: WireCharge =
            serde_json::from_str(&text).map_err(|e| GatewayError::Unavailable {
                detail: format!("unreadable gateway response: {e}"),
            })?;
        Ok(GatewayAcceptance {
            external_id: charge.id,
            status: map_status(&charge.status),
        })
    }

    async fn fetch_status(&self, external_id: &str) -> Result<GatewayChargeStatus, GatewayError> {
        let resp = self
            .http
            .get(format!("{}/v1/charges/{external_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_transport_error)?;
        if !status.is_success() {
            return Err(Self::map_response_error(status, &text));
        }
        let charge: WireCharge =
            serde_json::from_str(&text).map_err(|e| GatewayError::Unavailable {
                detail: format!("unreadable gateway response: {e}"),
            })?;
        Ok(map_status(&charge.status))
    }

    fn verify_webhook_signature(&self, raw_payload: &[u8], signature_header: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let ok = verify_signature(&self.webhook_secret, raw_payload, signature_header, now);
        if !ok {
            warn!("CURRENT gateway webhook signature rejected");
        }
        ok
    }

    fn parse_webhook(&self, raw_payload: &[u8]) -> Result<WebhookNotice, GatewayError> {
        let wire: WireWebhook =
            serde_json::from_slice(raw_payload).map_err(|e| GatewayError::MalformedWebhook {
                detail: format!("unparseable payload: {e}"),
            })?;
        if wire.event_id.is_empty() || wire.data.charge_id.is_empty() {
            return Err(GatewayError::MalformedWebhook {
                detail: "event_id and data.charge_id are required".into(),
            });
        }
        Ok(WebhookNotice {
            gateway_event_id: wire.event_id,
            external_id: wire.data.charge_id,
            status: map_status(&wire.data.status),
            raw_status: wire.data.status,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_current_test";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"event_id":"evt_1","data":{"charge_id":"ch_1","status":"paid"}}"#;
        let header = sign_payload(SECRET, now(), body);
        assert!(verify_signature(SECRET, body, &header, now()));
    }

    #[test]
    fn modified_payload_is_rejected() {
        let body = br#"{"event_id":"evt_1","data":{"charge_id":"ch_1","status":"paid"}}"#;
        let header = sign_payload(SECRET, now(), body);
        let tampered = br#"{"event_id":"evt_1","data":{"charge_id":"ch_2","status":"paid"}}"#;
        assert!(!verify_signature(SECRET, tampered, &header, now()));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"{}";
        let header = sign_payload("other_secret", now(), body);
        assert!(!verify_signature(SECRET, body, &header, now()));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = b"{}";
        let stale = now() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = sign_payload(SECRET, stale, body);
        assert!(!verify_signature(SECRET, body, &header, now()));
    }

    #[test]
    fn garbage_header_is_rejected() {
        assert!(!verify_signature(SECRET, b"{}", "garbage", now()));
        assert!(!verify_signature(SECRET, b"{}", "", now()));
        assert!(!verify_signature(SECRET, b"{}", "t=abc,v1=zz", now()));
    }

    #[test]
    fn webhook_parses_into_notice() {
        let client = CurrentGatewayClient::new(CurrentGatewayConfig {
            base_url: "http://localhost:0".into(),
            api_key: "key".into(),
            webhook_secret: SECRET.into(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();

        let body = br#"{"event_id":"evt_9","data":{"charge_id":"ch_42","status":"confirmed"}}"#;
        let notice = client.parse_webhook(body).unwrap();
        assert_eq!(notice.gateway_event_id, "evt_9");
        assert_eq!(notice.external_id, "ch_42");
        assert_eq!(notice.status, GatewayChargeStatus::Paid);
        assert_eq!(notice.raw_status, "confirmed");
    }

    #[test]
    fn webhook_missing_fields_is_malformed() {
        let client = CurrentGatewayClient::new(CurrentGatewayConfig {
            base_url: "http://localhost:0".into(),
            api_key: "key".into(),
            webhook_secret: SECRET.into(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();

        let err = client.parse_webhook(br#"{"data":{"status":"paid"}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedWebhook { .. }));
        let err = client
            .parse_webhook(br#"{"event_id":"","data":{"charge_id":"","status":"paid"}}"#)
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedWebhook { .. }));
    }

    #[test]
    fn status_mapping_covers_wire_vocabulary() {
        assert_eq!(map_status("pending"), GatewayChargeStatus::Pending);
        assert_eq!(map_status("paid"), GatewayChargeStatus::Paid);
        assert_eq!(map_status("confirmed"), GatewayChargeStatus::Paid);
        assert_eq!(map_status("failed"), GatewayChargeStatus::Failed);
        assert_eq!(map_status("refused"), GatewayChargeStatus::Failed);
        assert_eq!(map_status("created"), GatewayChargeStatus::Other);
    }
}
