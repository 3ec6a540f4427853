//! Operator CLI for the centime billing core.
//!
//! Read-side and maintenance commands only: database status/migrations,
//! audit-chain verification, per-customer migration control, and a direct
//! gateway status probe. Charge creation and webhooks always go through
//! ctm-api.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use ctm_audit::{AuditWriter, VerifyResult};
use ctm_config::{resolve_secret, BillingConfig};
use ctm_db::PgChargeStore;
use ctm_engine::{ChargeStore, GatewayClient};
use ctm_gateway_current::{CurrentGatewayClient, CurrentGatewayConfig};
use ctm_gateway_legacy::{LegacyGatewayClient, LegacyGatewayConfig};
use ctm_migration::MigrationCoordinator;
use ctm_schemas::GatewayVariant;

#[derive(Parser)]
#[command(name = "ctm")]
#[command(about = "Centime billing operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute the canonical config hash for a config file
    ConfigHash {
        /// Path to the YAML config
        path: String,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Per-customer gateway migration control
    Migration {
        #[command(subcommand)]
        cmd: MigrationCmd,
    },

    /// Ask the gateway directly for a charge's status (bypasses webhooks)
    ChargeProbe {
        /// Charge id
        #[arg(long)]
        charge_id: Uuid,

        /// Path to the YAML config (for gateway endpoints/secrets)
        #[arg(long, default_value = "config/centime.yaml")]
        config: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while charges are in
    /// flight (PENDING/RETRYING) unless --yes is provided.
    Migrate {
        /// Acknowledge you are migrating a DB with in-flight charges.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of a migration audit log
    Verify {
        /// Path to the JSONL audit log
        path: String,
    },
}

#[derive(Subcommand)]
enum MigrationCmd {
    /// Park a customer on the legacy gateway
    MarkLegacy {
        #[arg(long)]
        customer_id: Uuid,
        #[arg(long, default_value = "var/audit/migrations.jsonl")]
        audit_path: String,
    },

    /// Open the dual-gateway window
    BeginDual {
        #[arg(long)]
        customer_id: Uuid,
        #[arg(long, default_value = "var/audit/migrations.jsonl")]
        audit_path: String,
    },

    /// Close the migration (fails while legacy charges are open)
    Complete {
        #[arg(long)]
        customer_id: Uuid,
        #[arg(long, default_value = "var/audit/migrations.jsonl")]
        audit_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => db_cmd(cmd).await,
        Commands::ConfigHash { path } => config_hash(&path),
        Commands::Audit { cmd } => audit_cmd(cmd),
        Commands::Migration { cmd } => migration_cmd(cmd).await,
        Commands::ChargeProbe { charge_id, config } => charge_probe(charge_id, &config).await,
    }
}

async fn db_cmd(cmd: DbCmd) -> Result<()> {
    let pool = ctm_db::connect_from_env().await?;
    match cmd {
        DbCmd::Status => {
            let st = ctm_db::status(&pool).await?;
            println!("connectivity: {}", if st.ok { "ok" } else { "FAILED" });
            println!("schema:       {}", if st.has_charges_table { "present" } else { "absent" });
            if st.has_charges_table {
                let inflight = ctm_db::count_inflight_charges(&pool).await?;
                println!("in-flight:    {inflight} charge(s)");
            }
            Ok(())
        }
        DbCmd::Migrate { yes } => {
            let inflight = ctm_db::count_inflight_charges(&pool).await?;
            if inflight > 0 && !yes {
                bail!(
                    "{inflight} charge(s) are in flight; re-run with --yes to migrate anyway"
                );
            }
            ctm_db::migrate(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

fn config_hash(path: &str) -> Result<()> {
    let config = BillingConfig::load_from_path(path)?;
    println!("{}", config.config_hash()?);
    Ok(())
}

fn audit_cmd(cmd: AuditCmd) -> Result<()> {
    match cmd {
        AuditCmd::Verify { path } => match ctm_audit::verify_hash_chain(&path)? {
            VerifyResult::Valid { lines } => {
                println!("chain valid ({lines} events)");
                Ok(())
            }
            VerifyResult::Broken { line, reason } => {
                bail!("chain BROKEN at line {line}: {reason}")
            }
        },
    }
}

async fn migration_cmd(cmd: MigrationCmd) -> Result<()> {
    let pool = ctm_db::connect_from_env().await?;
    let store = Arc::new(PgChargeStore::new(pool));

    let run = |audit_path: String| -> Result<MigrationCoordinator> {
        let audit = AuditWriter::new(&audit_path, true)?;
        Ok(MigrationCoordinator::new(store.clone() as _, audit))
    };

    let customer = match cmd {
        MigrationCmd::MarkLegacy {
            customer_id,
            audit_path,
        } => run(audit_path)?.mark_legacy(customer_id).await,
        MigrationCmd::BeginDual {
            customer_id,
            audit_path,
        } => run(audit_path)?.begin_dual(customer_id).await,
        MigrationCmd::Complete {
            customer_id,
            audit_path,
        } => run(audit_path)?.complete_migration(customer_id).await,
    }
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!(
        "customer {} is now {}",
        customer.customer_id, customer.gateway_assignment
    );
    Ok(())
}

async fn charge_probe(charge_id: Uuid, config_path: &str) -> Result<()> {
    let config = BillingConfig::load_from_path(config_path)?;
    let pool = ctm_db::connect_from_env().await?;
    let store = PgChargeStore::new(pool);

    let charge = store
        .fetch_charge(charge_id)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .with_context(|| format!("charge {charge_id} not found"))?;
    let Some(external_id) = charge.external_id.as_deref() else {
        bail!("charge {charge_id} has no gateway transaction yet (status {})", charge.status);
    };

    let status = match charge.gateway_used {
        GatewayVariant::Current => {
            let client = CurrentGatewayClient::new(CurrentGatewayConfig {
                base_url: config.gateways.current.base_url.clone(),
                api_key: resolve_secret(&config.gateways.current.api_key_env)?,
                webhook_secret: resolve_secret(&config.gateways.current.webhook_secret_env)?,
                request_timeout: Duration::from_secs(config.gateways.current.request_timeout_secs),
            })
            .map_err(|e| anyhow::anyhow!("{e}"))?;
            client
                .fetch_status(external_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?
        }
        GatewayVariant::Legacy => {
            let client = LegacyGatewayClient::new(LegacyGatewayConfig {
                base_url: config.gateways.legacy.base_url.clone(),
                access_token: resolve_secret(&config.gateways.legacy.access_token_env)?,
                webhook_secret: resolve_secret(&config.gateways.legacy.webhook_secret_env)?,
                request_timeout: Duration::from_secs(config.gateways.legacy.request_timeout_secs),
            })
            .map_err(|e| anyhow::anyhow!("{e}"))?;
            client
                .fetch_status(external_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?
        }
    };

    println!("charge:      {charge_id}");
    println!("stored:      {}", charge.status);
    println!("gateway:     {} ({external_id})", charge.gateway_used);
    println!("gateway says {status:?}");
    Ok(())
}
