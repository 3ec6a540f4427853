//! ctm-api entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects the store, builds the gateway clients from env-injected
//! secrets, wires middleware, and starts the HTTP server. All route
//! handlers live in `routes.rs`; shared state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use ctm_api::{routes, state};
use ctm_audit::AuditWriter;
use ctm_config::{resolve_secret, BillingConfig};
use ctm_db::PgChargeStore;
use ctm_engine::{GatewaySet, Orchestrator, OrchestratorLimits};
use ctm_gateway_current::{CurrentGatewayClient, CurrentGatewayConfig};
use ctm_gateway_legacy::{LegacyGatewayClient, LegacyGatewayConfig};
use ctm_migration::MigrationCoordinator;
use ctm_reconcile::{ReconcilerLimits, WebhookReconciler};

const ENV_CONFIG_PATH: &str = "CTM_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_path =
        std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "config/centime.yaml".to_string());
    let config = BillingConfig::load_from_path(&config_path)
        .with_context(|| format!("load config {config_path}"))?;
    info!(config_hash = %config.config_hash()?, "configuration loaded");

    let pool = ctm_db::connect_from_env().await?;
    ctm_db::migrate(&pool).await?;
    let store = Arc::new(PgChargeStore::new(pool));

    let current = CurrentGatewayClient::new(CurrentGatewayConfig {
        base_url: config.gateways.current.base_url.clone(),
        api_key: resolve_secret(&config.gateways.current.api_key_env)?,
        webhook_secret: resolve_secret(&config.gateways.current.webhook_secret_env)?,
        request_timeout: std::time::Duration::from_secs(
            config.gateways.current.request_timeout_secs,
        ),
    })
    .map_err(|e| anyhow::anyhow!("build current gateway client: {e}"))?;
    let legacy = LegacyGatewayClient::new(LegacyGatewayConfig {
        base_url: config.gateways.legacy.base_url.clone(),
        access_token: resolve_secret(&config.gateways.legacy.access_token_env)?,
        webhook_secret: resolve_secret(&config.gateways.legacy.webhook_secret_env)?,
        request_timeout: std::time::Duration::from_secs(
            config.gateways.legacy.request_timeout_secs,
        ),
    })
    .map_err(|e| anyhow::anyhow!("build legacy gateway client: {e}"))?;
    let gateways = GatewaySet::new(Arc::new(current), Arc::new(legacy));

    let audit = AuditWriter::new(&config.audit.path, config.audit.hash_chain)?;
    let migrations = MigrationCoordinator::new(Arc::clone(&store) as _, audit);

    let limits = OrchestratorLimits {
        gateway_timeout: config.gateway_timeout(),
        commit_attempts: config.orchestrator.commit_attempts,
        max_retries: config.orchestrator.max_retries,
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as _,
        Arc::new(state::UpstreamVouchedCatalog),
        Arc::new(migrations.clone()),
        gateways.clone(),
        limits,
    );
    let reconciler = WebhookReconciler::new(
        Arc::clone(&store) as _,
        gateways,
        ReconcilerLimits {
            commit_attempts: limits.commit_attempts,
            max_retries: limits.max_retries,
        },
    );

    let shared = Arc::new(state::AppState::new(orchestrator, reconciler, migrations));

    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr: SocketAddr = config
        .service
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr {:?}", config.service.bind_addr))?;
    info!("ctm-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
