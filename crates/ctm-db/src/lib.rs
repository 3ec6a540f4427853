//! Postgres repository for the billing core.
//!
//! [`PgChargeStore`] implements the engine's `ChargeStore` seam. Two rules
//! shape every query here:
//!
//! - Uniqueness (idempotency keys, webhook event ids, gateway transaction
//!   ids) is enforced by the schema's unique indexes; this module maps the
//!   constraint violations to typed errors instead of pre-checking.
//! - A transition commit is one status-guarded UPDATE: `where charge_id =
//!   $1 and status = $expected`. Zero rows affected means a concurrent
//!   writer won; nothing is written and the caller re-reads.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use ctm_engine::{
    ChargeRecord, ChargeState, ChargeStore, CommitOutcome, NewCharge, NewWebhookEvent, StoreError,
    TransitionUpdate, WebhookLedgerEntry,
};
use ctm_schemas::{
    BillingType, ChargeItem, Currency, Customer, GatewayAssignment, GatewayVariant, Money,
    ProductRef,
};

pub const ENV_DB_URL: &str = "CTM_DATABASE_URL";

/// Connect to Postgres using CTM_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='charges'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_charges_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_charges_table: bool,
}

/// Count charges with a gateway submission still in flight (PENDING or
/// RETRYING). Used by CLI guardrails to prevent schema changes under a
/// live billing database.
pub async fn count_inflight_charges(pool: &PgPool) -> Result<i64> {
    // If the schema doesn't exist yet, treat as 0 (safe) rather than failing.
    let st = status(pool).await?;
    if !st.has_charges_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from charges
        where status in ('PENDING','RETRYING')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("count_inflight_charges failed")?;

    Ok(n)
}

/// Detect a Postgres unique constraint violation by name.
fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Enum decode helpers
// ---------------------------------------------------------------------------

fn parse_state(s: &str) -> Result<ChargeState> {
    ChargeState::parse(s).ok_or_else(|| anyhow!("invalid charge status in db: {s}"))
}

fn parse_variant(s: &str) -> Result<GatewayVariant> {
    GatewayVariant::parse(s).ok_or_else(|| anyhow!("invalid gateway in db: {s}"))
}

fn parse_assignment(s: &str) -> Result<GatewayAssignment> {
    GatewayAssignment::parse(s).ok_or_else(|| anyhow!("invalid gateway assignment in db: {s}"))
}

fn parse_billing(s: &str) -> Result<BillingType> {
    BillingType::parse(s).ok_or_else(|| anyhow!("invalid billing type in db: {s}"))
}

fn parse_currency(s: &str) -> Result<Currency> {
    Currency::parse(s).ok_or_else(|| anyhow!("invalid currency in db: {s}"))
}

// ---------------------------------------------------------------------------
// PgChargeStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgChargeStore {
    pool: PgPool,
}

impl PgChargeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Provision a customer row. Customer CRUD is owned elsewhere; this
    /// exists for the operator CLI and DB tests.
    pub async fn insert_customer(&self, customer: &Customer) -> Result<()> {
        sqlx::query(
            r#"
            insert into customers (
              customer_id, name, email, tax_id, phone, gateway_assignment,
              legacy_external_id, current_external_id, created_at_utc
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(customer.customer_id)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(&customer.tax_id)
        .bind(&customer.phone)
        .bind(customer.gateway_assignment.as_str())
        .bind(&customer.legacy_external_id)
        .bind(&customer.current_external_id)
        .bind(customer.created_at_utc)
        .execute(&self.pool)
        .await
        .context("insert_customer failed")?;
        Ok(())
    }

    async fn fetch_items(&self, charge_id: Uuid) -> Result<Vec<ChargeItem>> {
        let rows = sqlx::query(
            r#"
            select product_type, product_id, amount_minor, currency
            from charge_items
            where charge_id = $1
            order by position
            "#,
        )
        .bind(charge_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch charge_items failed")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let currency = parse_currency(&row.try_get::<String, _>("currency")?)?;
            items.push(ChargeItem {
                product: ProductRef {
                    product_type: row.try_get("product_type")?,
                    product_id: row.try_get("product_id")?,
                },
                amount: Money::new(row.try_get("amount_minor")?, currency),
            });
        }
        Ok(items)
    }

    async fn charge_from_row(&self, row: sqlx::postgres::PgRow) -> Result<ChargeRecord> {
        let charge_id: Uuid = row.try_get("charge_id")?;
        let items = self.fetch_items(charge_id).await?;
        Ok(ChargeRecord {
            charge_id,
            customer_id: row.try_get("customer_id")?,
            billing_type: parse_billing(&row.try_get::<String, _>("billing_type")?)?,
            status: parse_state(&row.try_get::<String, _>("status")?)?,
            gateway_used: parse_variant(&row.try_get::<String, _>("gateway_used")?)?,
            external_id: row.try_get("external_id")?,
            due_date: row.try_get::<NaiveDate, _>("due_date")?,
            idempotency_key: row.try_get("idempotency_key")?,
            currency: parse_currency(&row.try_get::<String, _>("currency")?)?,
            retry_count: row.try_get("retry_count")?,
            items,
            created_at_utc: row.try_get::<DateTime<Utc>, _>("created_at_utc")?,
            updated_at_utc: row.try_get::<DateTime<Utc>, _>("updated_at_utc")?,
        })
    }

    async fn charge_from_optional_row(
        &self,
        row: Option<sqlx::postgres::PgRow>,
    ) -> Result<Option<ChargeRecord>> {
        match row {
            Some(row) => Ok(Some(self.charge_from_row(row).await?)),
            None => Ok(None),
        }
    }

    /// The status-guarded write shared by the orchestrator and reconciler
    /// commit paths. Returns the number of rows affected (0 = lost race).
    async fn guarded_update<'e, E>(executor: E, update: &TransitionUpdate) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let res = sqlx::query(
            r#"
            update charges
            set status = $1,
                external_id = coalesce(external_id, $2),
                retry_count = retry_count + $3,
                updated_at_utc = now()
            where charge_id = $4 and status = $5
            "#,
        )
        .bind(update.next.as_str())
        .bind(&update.set_external_id)
        .bind(if update.bump_retry { 1i32 } else { 0i32 })
        .bind(update.charge_id)
        .bind(update.expected.as_str())
        .execute(executor)
        .await
        .context("guarded charge update failed")?;
        Ok(res.rows_affected())
    }

    async fn conflict_or_missing(&self, charge_id: Uuid) -> Result<CommitOutcome, StoreError> {
        let actual: Option<String> =
            sqlx::query_scalar("select status from charges where charge_id = $1")
                .bind(charge_id)
                .fetch_optional(&self.pool)
                .await
                .context("read charge status failed")
                .map_err(StoreError::Backend)?;
        match actual {
            None => Err(StoreError::ChargeNotFound { charge_id }),
            Some(s) => Ok(CommitOutcome::Conflict {
                actual: parse_state(&s).map_err(StoreError::Backend)?,
            }),
        }
    }

    async fn applied(&self, charge_id: Uuid) -> Result<CommitOutcome, StoreError> {
        let record = self
            .fetch_charge(charge_id)
            .await?
            .ok_or(StoreError::ChargeNotFound { charge_id })?;
        Ok(CommitOutcome::Applied(record))
    }
}

const SELECT_CHARGE: &str = r#"
    select charge_id, customer_id, billing_type, status, gateway_used,
           external_id, due_date, idempotency_key, currency, retry_count,
           created_at_utc, updated_at_utc
    from charges
"#;

#[async_trait]
impl ChargeStore for PgChargeStore {
    async fn insert_charge(&self, new: NewCharge) -> Result<ChargeRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin insert_charge tx failed")
            .map_err(StoreError::Backend)?;

        let inserted = sqlx::query(
            r#"
            insert into charges (
              charge_id, customer_id, billing_type, status, gateway_used,
              due_date, idempotency_key, currency, retry_count
            ) values ($1, $2, $3, 'CREATED', $4, $5, $6, $7, 0)
            "#,
        )
        .bind(new.charge_id)
        .bind(new.customer_id)
        .bind(new.billing_type.as_str())
        .bind(new.gateway_used.as_str())
        .bind(new.due_date)
        .bind(&new.idempotency_key)
        .bind(new.currency.as_str())
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_constraint_violation(&err, "uq_charges_idempotency_key") {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: new.idempotency_key,
                });
            }
            return Err(StoreError::Backend(
                anyhow::Error::new(err).context("insert charge failed"),
            ));
        }

        for (position, item) in new.items.iter().enumerate() {
            sqlx::query(
                r#"
                insert into charge_items (
                  charge_id, position, product_type, product_id, amount_minor, currency
                ) values ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(new.charge_id)
            .bind(position as i32)
            .bind(&item.product.product_type)
            .bind(item.product.product_id)
            .bind(item.amount.minor_units())
            .bind(item.amount.currency().as_str())
            .execute(&mut *tx)
            .await
            .context("insert charge_item failed")
            .map_err(StoreError::Backend)?;
        }

        tx.commit()
            .await
            .context("commit insert_charge tx failed")
            .map_err(StoreError::Backend)?;

        self.fetch_charge(new.charge_id)
            .await?
            .ok_or(StoreError::ChargeNotFound {
                charge_id: new.charge_id,
            })
    }

    async fn fetch_charge(&self, charge_id: Uuid) -> Result<Option<ChargeRecord>, StoreError> {
        let sql = format!("{SELECT_CHARGE} where charge_id = $1");
        let row = sqlx::query(&sql)
            .bind(charge_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_charge failed")
            .map_err(StoreError::Backend)?;
        self.charge_from_optional_row(row)
            .await
            .map_err(StoreError::Backend)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ChargeRecord>, StoreError> {
        let sql = format!("{SELECT_CHARGE} where idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("find_by_idempotency_key failed")
            .map_err(StoreError::Backend)?;
        self.charge_from_optional_row(row)
            .await
            .map_err(StoreError::Backend)
    }

    async fn find_by_external_id(
        &self,
        gateway: GatewayVariant,
        external_id: &str,
    ) -> Result<Option<ChargeRecord>, StoreError> {
        let sql = format!("{SELECT_CHARGE} where gateway_used = $1 and external_id = $2");
        let row = sqlx::query(&sql)
            .bind(gateway.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .context("find_by_external_id failed")
            .map_err(StoreError::Backend)?;
        self.charge_from_optional_row(row)
            .await
            .map_err(StoreError::Backend)
    }

    async fn commit_transition(
        &self,
        update: TransitionUpdate,
    ) -> Result<CommitOutcome, StoreError> {
        let affected = Self::guarded_update(&self.pool, &update)
            .await
            .map_err(StoreError::Backend)?;
        if affected == 0 {
            return self.conflict_or_missing(update.charge_id).await;
        }
        self.applied(update.charge_id).await
    }

    async fn webhook_event(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<Option<WebhookLedgerEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            select gateway, gateway_event_id, charge_id, received_status,
                   received_at_utc, processed_at_utc
            from webhook_events
            where gateway = $1 and gateway_event_id = $2
            "#,
        )
        .bind(gateway.as_str())
        .bind(gateway_event_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch webhook_event failed")
        .map_err(StoreError::Backend)?;

        let Some(row) = row else { return Ok(None) };
        let entry = (|| -> Result<WebhookLedgerEntry> {
            Ok(WebhookLedgerEntry {
                gateway: parse_variant(&row.try_get::<String, _>("gateway")?)?,
                gateway_event_id: row.try_get("gateway_event_id")?,
                charge_id: row.try_get("charge_id")?,
                received_status: row.try_get("received_status")?,
                received_at_utc: row.try_get("received_at_utc")?,
                processed_at_utc: row.try_get("processed_at_utc")?,
            })
        })()
        .map_err(StoreError::Backend)?;
        Ok(Some(entry))
    }

    async fn record_webhook_received(&self, ev: NewWebhookEvent) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            insert into webhook_events (gateway, gateway_event_id, charge_id, received_status)
            values ($1, $2, $3, $4)
            on conflict on constraint uq_webhook_events_gateway_event do nothing
            "#,
        )
        .bind(ev.gateway.as_str())
        .bind(&ev.gateway_event_id)
        .bind(ev.charge_id)
        .bind(&ev.received_status)
        .execute(&self.pool)
        .await
        .context("record_webhook_received failed")
        .map_err(StoreError::Backend)?;

        Ok(res.rows_affected() == 1)
    }

    async fn commit_webhook_transition(
        &self,
        update: TransitionUpdate,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin webhook tx failed")
            .map_err(StoreError::Backend)?;

        let affected = Self::guarded_update(&mut *tx, &update)
            .await
            .map_err(StoreError::Backend)?;
        if affected == 0 {
            // Nothing written; the implicit rollback on drop is fine.
            return self.conflict_or_missing(update.charge_id).await;
        }

        sqlx::query(
            r#"
            update webhook_events
            set processed_at_utc = now()
            where gateway = $1 and gateway_event_id = $2 and processed_at_utc is null
            "#,
        )
        .bind(gateway.as_str())
        .bind(gateway_event_id)
        .execute(&mut *tx)
        .await
        .context("stamp webhook_event failed")
        .map_err(StoreError::Backend)?;

        tx.commit()
            .await
            .context("commit webhook tx failed")
            .map_err(StoreError::Backend)?;

        self.applied(update.charge_id).await
    }

    async fn mark_webhook_processed(
        &self,
        gateway: GatewayVariant,
        gateway_event_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            update webhook_events
            set processed_at_utc = now()
            where gateway = $1 and gateway_event_id = $2 and processed_at_utc is null
            "#,
        )
        .bind(gateway.as_str())
        .bind(gateway_event_id)
        .execute(&self.pool)
        .await
        .context("mark_webhook_processed failed")
        .map_err(StoreError::Backend)?;
        Ok(())
    }

    async fn fetch_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            r#"
            select customer_id, name, email, tax_id, phone, gateway_assignment,
                   legacy_external_id, current_external_id, created_at_utc
            from customers
            where customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_customer failed")
        .map_err(StoreError::Backend)?;

        let Some(row) = row else { return Ok(None) };
        let customer = (|| -> Result<Customer> {
            Ok(Customer {
                customer_id: row.try_get("customer_id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                tax_id: row.try_get("tax_id")?,
                phone: row.try_get("phone")?,
                gateway_assignment: parse_assignment(
                    &row.try_get::<String, _>("gateway_assignment")?,
                )?,
                legacy_external_id: row.try_get("legacy_external_id")?,
                current_external_id: row.try_get("current_external_id")?,
                created_at_utc: row.try_get("created_at_utc")?,
            })
        })()
        .map_err(StoreError::Backend)?;
        Ok(Some(customer))
    }

    async fn set_gateway_assignment(
        &self,
        customer_id: Uuid,
        from: GatewayAssignment,
        to: GatewayAssignment,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin assignment tx failed")
            .map_err(StoreError::Backend)?;

        let res = sqlx::query(
            r#"
            update customers
            set gateway_assignment = $1
            where customer_id = $2
            "#,
        )
        .bind(to.as_str())
        .bind(customer_id)
        .execute(&mut *tx)
        .await
        .context("update gateway_assignment failed")
        .map_err(StoreError::Backend)?;

        if res.rows_affected() == 0 {
            return Err(StoreError::CustomerNotFound { customer_id });
        }

        sqlx::query(
            r#"
            insert into migration_log (customer_id, from_assignment, to_assignment)
            values ($1, $2, $3)
            "#,
        )
        .bind(customer_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .context("append migration_log failed")
        .map_err(StoreError::Backend)?;

        tx.commit()
            .await
            .context("commit assignment tx failed")
            .map_err(StoreError::Backend)?;
        Ok(())
    }

    async fn count_open_charges_on(
        &self,
        customer_id: Uuid,
        gateway: GatewayVariant,
    ) -> Result<i64, StoreError> {
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
            r#"
            select count(*)::bigint
            from charges
            where customer_id = $1
              and gateway_used = $2
              and status not in ('PAID','DEAD')
            "#,
        )
        .bind(customer_id)
        .bind(gateway.as_str())
        .fetch_one(&self.pool)
        .await
        .context("count_open_charges_on failed")
        .map_err(StoreError::Backend)?;
        Ok(n)
    }
}
