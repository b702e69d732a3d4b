//! Database layer.
//!
//! PostgreSQL via sqlx. Besides plain reads and inserts this module owns the
//! coordination queries the lifecycle engine is built on:
//!
//! - the scheduler's skip-locked claim (`FOR UPDATE SKIP LOCKED`), which lets
//!   any number of claimer replicas divide pending jobs without coordination
//! - the recovery sweep that returns stalled `processing` jobs to `pending`
//! - the worker's non-waiting re-validation lock (`FOR UPDATE NOWAIT`)
//! - the atomic finalize+refund transaction

use sqlx::{postgres::PgPoolOptions, PgPool};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{AtelierError, ErrorCode, Result};
use crate::jobs::{JobSpec, JobStatus, UnitError};
use crate::ledger::{self, LedgerEntry};
use crate::payments::OrderStatus;

/// Database connection and operations.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&cfg.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AtelierError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Account Operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a new account with a zero balance.
    pub async fn create_account(&self) -> Result<AccountRow> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO accounts (id) VALUES ($1)
            RETURNING id, balance, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Get account by ID.
    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, balance, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Get an account's ledger entries, oldest first.
    pub async fn get_ledger_entries(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT id, account_id, category, amount, balance_before, balance_after,
                   job_id, order_id, created_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Job Operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a job and charge the account for it, atomically.
    ///
    /// `InsufficientBalance` rolls the insert back: no job row exists for a
    /// charge that was rejected.
    pub async fn create_job_with_charge(
        &self,
        account_id: Uuid,
        spec: &JobSpec,
        expected_units: i32,
        batch_count: i32,
        unit_price: i64,
    ) -> Result<JobRow> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, account_id, status, spec, expected_unit_count, batch_count)
            VALUES ($1, $2, 'pending', $3, $4, $5)
            RETURNING id, account_id, status, spec, expected_unit_count, actual_unit_count,
                      batch_count, error_summary, unit_errors, result_urls, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(serde_json::to_value(spec)?)
        .bind(expected_units)
        .bind(batch_count)
        .fetch_one(tx.as_mut())
        .await?;

        ledger::charge(tx.as_mut(), account_id, job.id, expected_units, unit_price).await?;

        tx.commit().await?;

        Ok(job)
    }

    /// Get job by ID.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, account_id, status, spec, expected_unit_count, actual_unit_count,
                   batch_count, error_summary, unit_errors, result_urls, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Claim up to `batch_size` pending jobs, oldest first.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes concurrent claimers take disjoint sets:
    /// rows locked by another claimer's transaction are skipped, not waited
    /// on, so claim-uniqueness is a database property rather than application
    /// coordination.
    pub async fn claim_pending_jobs(&self, batch_size: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Return stalled `processing` jobs to `pending`.
    ///
    /// A job is stalled when its heartbeat (`updated_at`) is older than the
    /// processing timeout — the worker crashed or lost its claim before
    /// finishing. Uses the same skip-locked pattern as the claim so multiple
    /// sweep replicas never fight over a row.
    pub async fn recover_stalled_jobs(&self, processing_timeout: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(processing_timeout).unwrap_or(chrono::Duration::zero());

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'pending', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'processing' AND updated_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Re-validate a dispatched job with a non-waiting lock.
    ///
    /// Returns the job when this worker now owns it (heartbeat bumped), or
    /// `None` when the row is locked by another worker (`NOWAIT` raised
    /// 55P03) or no longer `processing` — both are silent skips, not errors.
    pub async fn lock_processing_job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, account_id, status, spec, expected_unit_count, actual_unit_count,
                   batch_count, error_summary, unit_errors, result_urls, created_at, updated_at
            FROM jobs
            WHERE id = $1 AND status = 'processing'
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(job_id)
        .fetch_optional(tx.as_mut())
        .await;

        let job = match locked {
            Ok(Some(job)) => job,
            Ok(None) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                let err = AtelierError::from(e);
                if err.code() == ErrorCode::LockContention {
                    tx.rollback().await?;
                    return Ok(None);
                }
                return Err(err);
            }
        };

        sqlx::query("UPDATE jobs SET updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;

        Ok(Some(job))
    }

    /// Touch the heartbeat of an actively processed job.
    ///
    /// Returns false when the job is no longer `processing` (the recovery
    /// sweep took it back), which tells the worker its claim is gone.
    pub async fn touch_job_heartbeat(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET updated_at = NOW() WHERE id = $1 AND status = 'processing'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write a job's terminal state and refund the undelivered units in one
    /// transaction.
    ///
    /// The update is guarded by `status = 'processing'`; returns false (and
    /// commits nothing) when another path already finalized or reclaimed the
    /// job.
    pub async fn finalize_job_with_refund(
        &self,
        job_id: Uuid,
        status: JobStatus,
        actual_units: i32,
        error_summary: Option<&str>,
        unit_errors: &[UnitError],
        result_urls: &[String],
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let mut tx = self.pool.begin().await?;

        let finalized: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = $2,
                actual_unit_count = $3,
                error_summary = $4,
                unit_errors = $5,
                result_urls = $6,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING account_id, expected_unit_count
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(actual_units)
        .bind(error_summary)
        .bind(if unit_errors.is_empty() {
            None
        } else {
            Some(serde_json::to_value(unit_errors)?)
        })
        .bind(if result_urls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(result_urls)?)
        })
        .fetch_optional(tx.as_mut())
        .await?;

        let Some((account_id, expected_units)) = finalized else {
            tx.rollback().await?;
            return Ok(false);
        };

        ledger::refund(tx.as_mut(), account_id, job_id, expected_units, actual_units).await?;

        tx.commit().await?;

        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Payment Order Operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a new pending payment order.
    pub async fn insert_payment_order(
        &self,
        account_id: Uuid,
        amount: i64,
        provider: &str,
        merchant_order_id: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<PaymentOrderRow> {
        let row = sqlx::query_as::<_, PaymentOrderRow>(
            r#"
            INSERT INTO payment_orders
                (id, account_id, amount, provider, merchant_order_id, status, expire_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING id, account_id, amount, provider, merchant_order_id,
                      external_transaction_id, status, expire_at, settled_at,
                      linked_ledger_entry_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(amount)
        .bind(provider)
        .bind(merchant_order_id)
        .bind(expire_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Get a payment order by its merchant order id.
    pub async fn get_order_by_merchant_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrderRow>> {
        let row = sqlx::query_as::<_, PaymentOrderRow>(
            r#"
            SELECT id, account_id, amount, provider, merchant_order_id,
                   external_transaction_id, status, expire_at, settled_at,
                   linked_ledger_entry_id, created_at, updated_at
            FROM payment_orders
            WHERE merchant_order_id = $1
            "#,
        )
        .bind(merchant_order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Close an order on user request. Only a `pending` order can be closed;
    /// returns false otherwise.
    pub async fn close_order_if_pending(&self, merchant_order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_orders
            SET status = 'closed', updated_at = NOW()
            WHERE merchant_order_id = $1 AND status = 'pending'
            "#,
        )
        .bind(merchant_order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AccountRow {
    pub id: Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: String,
    pub spec: serde_json::Value,
    pub expected_unit_count: i32,
    pub actual_unit_count: Option<i32>,
    pub batch_count: i32,
    pub error_summary: Option<String>,
    pub unit_errors: Option<serde_json::Value>,
    pub result_urls: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn parse_spec(&self) -> Result<JobSpec> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }

    pub fn parse_unit_errors(&self) -> Vec<UnitError> {
        self.unit_errors
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn parse_result_urls(&self) -> Vec<String> {
        self.result_urls
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentOrderRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub provider: String,
    pub merchant_order_id: String,
    pub external_transaction_id: Option<String>,
    pub status: String,
    pub expire_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub linked_ledger_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrderRow {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}
