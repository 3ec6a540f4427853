//! Billing service configuration.
//!
//! Config is a YAML file of non-secret settings; anything secret (gateway
//! API keys, webhook secrets) is referenced by environment-variable *name*
//! (`*_env` keys) and injected at runtime. Loading aborts if a leaf string
//! in the file looks like an inline credential, so a pasted live key never
//! ships in a config commit.
//!
//! `config_hash` is a SHA-256 over the canonicalized (key-sorted, compact)
//! JSON rendering of the file; it is logged at boot so operators can match
//! a running service to the exact configuration it loaded.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Known secret-like prefixes. If any leaf string value in the config file
/// starts with one of these, loading aborts with CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "whsec_",     // Stripe webhook secret
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
];

// ---------------------------------------------------------------------------
// Config shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub service: ServiceConfig,
    pub gateways: GatewaysConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// e.g. "127.0.0.1:8180"
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaysConfig {
    pub current: CurrentGatewaySection,
    pub legacy: LegacyGatewaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentGatewaySection {
    pub base_url: String,
    /// Name of the env var holding the API key — never the key itself.
    pub api_key_env: String,
    pub webhook_secret_env: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyGatewaySection {
    pub base_url: String,
    pub access_token_env: String,
    pub webhook_secret_env: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_secs: default_gateway_timeout_secs(),
            commit_attempts: default_commit_attempts(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSONL migration audit log path.
    pub path: String,
    #[serde(default = "default_true")]
    pub hash_chain: bool,
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_commit_attempts() -> u32 {
    3
}

fn default_max_retries() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

impl BillingConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config {:?}", path.as_ref()))?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Self> {
        let value: Value =
            serde_yaml::from_str(raw).context("config is not valid YAML")?;
        scan_for_inline_secrets(&value, "")?;
        let config: BillingConfig =
            serde_json::from_value(value).context("config shape invalid")?;
        Ok(config)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.gateway_timeout_secs)
    }

    /// SHA-256 of the canonical JSON rendering. Stable across key order
    /// and whitespace changes in the YAML source.
    pub fn config_hash(&self) -> Result<String> {
        let value = serde_json::to_value(self).context("serialize config failed")?;
        let canonical = canonical_json(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Resolve a `*_env` reference into the secret it names.
pub fn resolve_secret(env_name: &str) -> Result<String> {
    let value = std::env::var(env_name)
        .with_context(|| format!("secret env var {env_name} is not set"))?;
    if value.trim().is_empty() {
        bail!("secret env var {env_name} is empty");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Secret scan / canonicalization
// ---------------------------------------------------------------------------

fn scan_for_inline_secrets(v: &Value, path: &str) -> Result<()> {
    match v {
        Value::String(s) => {
            for prefix in SECRET_PREFIXES {
                if s.starts_with(prefix) {
                    bail!(
                        "CONFIG_SECRET_DETECTED at {}: value starts with {:?}; \
                         reference secrets via *_env keys instead",
                        if path.is_empty() { "<root>" } else { path },
                        prefix
                    );
                }
            }
            Ok(())
        }
        Value::Object(map) => {
            for (k, child) in map {
                scan_for_inline_secrets(child, &format!("{path}/{k}"))?;
            }
            Ok(())
        }
        Value::Array(arr) => {
            for (i, child) in arr.iter().enumerate() {
                scan_for_inline_secrets(child, &format!("{path}/{i}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn canonical_json(v: &Value) -> String {
    fn sort_keys(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                let mut new = serde_json::Map::new();
                for k in keys {
                    new.insert(k.clone(), sort_keys(&map[&k]));
                }
                Value::Object(new)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
            _ => v.clone(),
        }
    }
    // Canonical value is always serializable.
    serde_json::to_string(&sort_keys(v)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service:
  bind_addr: "127.0.0.1:8180"
gateways:
  current:
    base_url: "https://api.current-gateway.example"
    api_key_env: "CTM_CURRENT_API_KEY"
    webhook_secret_env: "CTM_CURRENT_WEBHOOK_SECRET"
  legacy:
    base_url: "https://legacy-gateway.example"
    access_token_env: "CTM_LEGACY_ACCESS_TOKEN"
    webhook_secret_env: "CTM_LEGACY_WEBHOOK_SECRET"
    request_timeout_secs: 5
orchestrator:
  gateway_timeout_secs: 8
audit:
  path: "var/audit/migrations.jsonl"
"#;

    #[test]
    fn sample_config_loads_with_defaults() {
        let cfg = BillingConfig::load_from_str(SAMPLE).unwrap();
        assert_eq!(cfg.service.bind_addr, "127.0.0.1:8180");
        assert_eq!(cfg.gateways.current.request_timeout_secs, 10);
        assert_eq!(cfg.gateways.legacy.request_timeout_secs, 5);
        assert_eq!(cfg.orchestrator.gateway_timeout_secs, 8);
        assert_eq!(cfg.orchestrator.commit_attempts, 3);
        assert!(cfg.audit.hash_chain);
    }

    #[test]
    fn config_hash_is_stable_across_formatting() {
        let cfg_a = BillingConfig::load_from_str(SAMPLE).unwrap();
        // Same settings, different YAML layout / key order.
        let reordered = r#"
audit:
  path: "var/audit/migrations.jsonl"
orchestrator:
  gateway_timeout_secs: 8
gateways:
  legacy:
    request_timeout_secs: 5
    webhook_secret_env: "CTM_LEGACY_WEBHOOK_SECRET"
    access_token_env: "CTM_LEGACY_ACCESS_TOKEN"
    base_url: "https://legacy-gateway.example"
  current:
    webhook_secret_env: "CTM_CURRENT_WEBHOOK_SECRET"
    api_key_env: "CTM_CURRENT_API_KEY"
    base_url: "https://api.current-gateway.example"
service:
  bind_addr: "127.0.0.1:8180"
"#;
        let cfg_b = BillingConfig::load_from_str(reordered).unwrap();
        assert_eq!(cfg_a.config_hash().unwrap(), cfg_b.config_hash().unwrap());
    }

    #[test]
    fn config_hash_changes_with_settings() {
        let cfg_a = BillingConfig::load_from_str(SAMPLE).unwrap();
        let mut cfg_b = cfg_a.clone();
        cfg_b.orchestrator.max_retries = 5;
        assert_ne!(cfg_a.config_hash().unwrap(), cfg_b.config_hash().unwrap());
    }

    #[test]
    fn inline_secret_aborts_load() {
        let leaky = SAMPLE.replace("CTM_CURRENT_API_KEY", "sk_live_abc123");
        let err = BillingConfig::load_from_str(&leaky).unwrap_err();
        assert!(err.to_string().contains("CONFIG_SECRET_DETECTED"));
    }

    #[test]
    fn missing_secret_env_is_reported_by_name() {
        let err = resolve_secret("CTM_DOES_NOT_EXIST_XYZ").unwrap_err();
        assert!(err.to_string().contains("CTM_DOES_NOT_EXIST_XYZ"));
    }
}
