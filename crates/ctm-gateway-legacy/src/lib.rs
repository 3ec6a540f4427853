//! HTTP adapter for the LEGACY payment gateway.
//!
//! The legacy wire protocol predates the current gateway's conventions:
//! authentication rides in an `access_token` header, charges are
//! "transactions" identified by a `token`, statuses are "situations", and
//! webhooks are signed with a bare hex HMAC-SHA256 of the body in
//! `X-Hook-Signature` (no timestamp — the legacy gateway never shipped
//! one, so replay protection for this variant rests on the dedup ledger).
//!
//! Same [`GatewayClient`] contract as the current adapter; only this crate
//! knows the differences.

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

// ---------------------------------------------------------------------------
// Config / client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LegacyGatewayConfig {
    pub base_url: String,
    pub access_token: String,
    pub webhook_secret: String,
    pub request_timeout: Duration,
}

pub struct LegacyGatewayClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    webhook_secret: String,
}

impl LegacyGatewayClient {
    pub fn new(cfg: LegacyGatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable {
                detail: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            access_token: cfg.access_token,
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
        let reason = serde_json::from_str::<WireFault>(body)
            .map(|f| f.message)
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
struct WireTransactionRequest<'a> {
    merchant_reference: &'a str,
    payer: WirePayer<'a>,
    kind: &'static str,
    expires_on: String,
    total_cents: i64,
    entries: Vec<WireEntry>,
}

#[derive(Debug, Serialize)]
struct WirePayer<'a> {
    full_name: &'a str,
    email_address: &'a str,
    document: &'a str,
    telephone: &'a str,
}

#[derive(Debug, Serialize)]
struct WireEntry {
    sku: String,
    cents: i64,
}

#[derive(Debug, Deserialize)]
struct WireTransactionEnvelope {
    transaction: WireTransaction,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    token: String,
    situation: String,
}

#[derive(Debug, Deserialize)]
struct WireFault {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireNotification {
    notification_id: String,
    transaction_token: String,
    situation: String,
}

fn map_situation(raw: &str) -> GatewayChargeStatus {
    match raw {
        "waiting" | "processing" => GatewayChargeStatus::Pending,
        "approved" | "paid" => GatewayChargeStatus::Paid,
        "declined" | "refused" | "expired" => GatewayChargeStatus::Failed,
        _ => GatewayChargeStatus::Other,
    }
}

fn kind_label(billing: BillingType) -> &'static str {
    match billing {
        BillingType::OneTime => "single",
        BillingType::Recurring => "subscription",
    }
}

// ---------------------------------------------------------------------------
// Signature scheme
// ---------------------------------------------------------------------------

/// Hex HMAC-SHA256 over the raw body — the whole legacy scheme. Exposed
/// for tests and sandbox tooling.
pub fn sign_payload(secret: &str, raw_payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_payload);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &str, raw_payload: &[u8], signature_header: &str) -> bool {
    let Ok(claimed) = hex::decode(signature_header.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_payload);
    mac.verify_slice(&claimed).is_ok()
}

// ---------------------------------------------------------------------------
// GatewayClient impl
// ---------------------------------------------------------------------------

#[async_trait]
impl GatewayClient for LegacyGatewayClient {
    fn variant(&self) -> GatewayVariant {
        GatewayVariant::Legacy
    }

    async fn create_charge(
        &self,
        call: &CreateChargeCall,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let total_cents = call.items.iter().map(|i| i.amount.minor_units()).sum();
        let body = WireTransactionRequest {
            merchant_reference: &call.reference,
            payer: WirePayer {
                full_name: &call.customer.name,
                email_address: &call.customer.email,
                document: &call.customer.tax_id,
                telephone: &call.customer.phone,
            },
            kind: kind_label(call.billing_type),
            expires_on: call.due_date.to_string(),
            total_cents,
            entries: call
                .items
                .iter()
                .map(|i| WireEntry {
                    sku: i.product.to_string(),
                    cents: i.amount.minor_units(),
                })
                .collect(),
        };

        let resp = self
            .http
            .post(format!("{}/api/transactions", self.base_url))
            .header("access_token", &self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_transport_error)?;
        if !status.is_success() {
            return Err(Self::map_response_error(status, &text));
        }

        let envelope: WireTransactionEnvelope =
            serde_json::from_str(&text).map_err(|e| GatewayError::Unavailable {
                detail: format!("unreadable gateway response: {e}"),
            })?;
        Ok(GatewayAcceptance {
            external_id: envelope.transaction.token,
            status: map_situation(&envelope.transaction.situation),
        })
    }

    async fn fetch_status(&self, external_id: &str) -> Result<GatewayChargeStatus, GatewayError> {
        let resp = self
            .http
            .get(format!("{}/api/transactions/{external_id}", self.base_url))
            .header("access_token", &self.access_token)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_transport_error)?;
        if !status.is_success() {
            return Err(Self::map_response_error(status, &text));
        }
        let envelope: WireTransactionEnvelope =
            serde_json::from_str(&text).map_err(|e| GatewayError::Unavailable {
                detail: format!("unreadable gateway response: {e}"),
            })?;
        Ok(map_situation(&envelope.transaction.situation))
    }

    fn verify_webhook_signature(&self, raw_payload: &[u8], signature_header: &str) -> bool {
        let ok = verify_signature(&self.webhook_secret, raw_payload, signature_header);
        if !ok {
            warn!("LEGACY gateway webhook signature rejected");
        }
        ok
    }

    fn parse_webhook(&self, raw_payload: &[u8]) -> Result<WebhookNotice, GatewayError> {
        let wire: WireNotification =
            serde_json::from_slice(raw_payload).map_err(|e| GatewayError::MalformedWebhook {
                detail: format!("unparseable payload: {e}"),
            })?;
        if wire.notification_id.is_empty() || wire.transaction_token.is_empty() {
            return Err(GatewayError::MalformedWebhook {
                detail: "notification_id and transaction_token are required".into(),
            });
        }
        Ok(WebhookNotice {
            gateway_event_id: wire.notification_id,
            external_id: wire.transaction_token,
            status: map_situation(&wire.situation),
            raw_status: wire.situation,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "legacy_hook_secret";

    fn client() -> LegacyGatewayClient {
        LegacyGatewayClient::new(LegacyGatewayConfig {
            base_url: "http://localhost:0".into(),
            access_token: "tok".into(),
            webhook_secret: SECRET.into(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"notification_id":"n1","transaction_token":"tx1","situation":"approved"}"#;
        let header = sign_payload(SECRET, body);
        assert!(verify_signature(SECRET, body, &header));
    }

    #[test]
    fn modified_payload_is_rejected() {
        let body = br#"{"notification_id":"n1","transaction_token":"tx1","situation":"approved"}"#;
        let header = sign_payload(SECRET, body);
        let tampered =
            br#"{"notification_id":"n1","transaction_token":"tx2","situation":"approved"}"#;
        assert!(!verify_signature(SECRET, tampered, &header));
    }

    #[test]
    fn non_hex_header_is_rejected() {
        assert!(!verify_signature(SECRET, b"{}", "not-hex!"));
        assert!(!verify_signature(SECRET, b"{}", ""));
    }

    #[test]
    fn webhook_parses_into_notice() {
        let body = br#"{"notification_id":"n7","transaction_token":"tx9","situation":"declined"}"#;
        let notice = client().parse_webhook(body).unwrap();
        assert_eq!(notice.gateway_event_id, "n7");
        assert_eq!(notice.external_id, "tx9");
        assert_eq!(notice.status, GatewayChargeStatus::Failed);
        assert_eq!(notice.raw_status, "declined");
    }

    #[test]
    fn webhook_missing_fields_is_malformed() {
        let err = client()
            .parse_webhook(br#"{"situation":"approved"}"#)
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedWebhook { .. }));
    }

    #[test]
    fn situation_mapping_covers_wire_vocabulary() {
        assert_eq!(map_situation("waiting"), GatewayChargeStatus::Pending);
        assert_eq!(map_situation("approved"), GatewayChargeStatus::Paid);
        assert_eq!(map_situation("declined"), GatewayChargeStatus::Failed);
        assert_eq!(map_situation("expired"), GatewayChargeStatus::Failed);
        assert_eq!(map_situation("archived"), GatewayChargeStatus::Other);
    }
}
