//! Financial ledger.
//!
//! Every balance mutation goes through one of the three primitives in this
//! module — [`charge`], [`refund`], [`settle`] — each of which locks the
//! account row (`SELECT ... FOR UPDATE`) for the duration of the mutation and
//! appends an immutable [`LedgerEntry`]. Entries for an account form a chain:
//! each `balance_after` equals the next entry's `balance_before`.
//!
//! All primitives take `&mut PgConnection` so callers can compose them into
//! an enclosing transaction (job finalize + refund, order settle) and get
//! all-or-nothing semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::fmt;
use uuid::Uuid;

use crate::error::{AtelierError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Entry Model
// ═══════════════════════════════════════════════════════════════════════════════

/// Category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCategory {
    /// Debit at job creation
    JobCharge,
    /// Credit for units the job did not deliver
    JobRefund,
    /// Credit from a settled payment order
    OrderSettlement,
}

impl EntryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCharge => "job_charge",
            Self::JobRefund => "job_refund",
            Self::OrderSettlement => "order_settlement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job_charge" => Some(Self::JobCharge),
            "job_refund" => Some(Self::JobRefund),
            "order_settlement" => Some(Self::OrderSettlement),
            _ => None,
        }
    }

    /// Whether this category debits (rather than credits) the account.
    pub fn is_debit(&self) -> bool {
        matches!(self, Self::JobCharge)
    }
}

impl fmt::Display for EntryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable ledger row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub category: String,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub job_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn category(&self) -> Option<EntryCategory> {
        EntryCategory::parse(&self.category)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Refund Arithmetic
// ═══════════════════════════════════════════════════════════════════════════════

/// Amount to credit back for a finished job.
///
/// The per-unit price is derived from the original charge divided by the
/// expected unit count (integer division in minor units — the remainder
/// stays with the charge). A total failure refunds the original charge
/// amount verbatim so no rounding loss occurs on the full-failure path.
pub fn refund_amount(charge_amount: i64, expected_units: i32, actual_units: i32) -> i64 {
    let overcharged = i64::from(expected_units) - i64::from(actual_units);
    if overcharged <= 0 {
        return 0;
    }
    if actual_units <= 0 {
        return charge_amount;
    }
    let unit_price = charge_amount / i64::from(expected_units);
    unit_price * overcharged
}

// ═══════════════════════════════════════════════════════════════════════════════
// Primitives
// ═══════════════════════════════════════════════════════════════════════════════

/// Lock the account row and return its current balance.
async fn lock_balance(conn: &mut PgConnection, account_id: Uuid) -> Result<i64> {
    let balance: Option<i64> =
        sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await?;

    balance.ok_or_else(|| AtelierError::not_found("account", account_id.to_string()))
}

async fn write_balance(conn: &mut PgConnection, account_id: Uuid, balance: i64) -> Result<()> {
    sqlx::query("UPDATE accounts SET balance = $2, updated_at = NOW() WHERE id = $1")
        .bind(account_id)
        .bind(balance)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn append_entry(
    conn: &mut PgConnection,
    account_id: Uuid,
    category: EntryCategory,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    job_id: Option<Uuid>,
    order_id: Option<Uuid>,
) -> Result<LedgerEntry> {
    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries
            (id, account_id, category, amount, balance_before, balance_after, job_id, order_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, account_id, category, amount, balance_before, balance_after,
                  job_id, order_id, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(category.as_str())
    .bind(amount)
    .bind(balance_before)
    .bind(balance_after)
    .bind(job_id)
    .bind(order_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(entry)
}

/// Debit an account for a new job.
///
/// Fails with `InsufficientBalance` (and no mutation) when the balance does
/// not cover `expected_units × unit_price`.
pub async fn charge(
    conn: &mut PgConnection,
    account_id: Uuid,
    job_id: Uuid,
    expected_units: i32,
    unit_price: i64,
) -> Result<LedgerEntry> {
    let total = i64::from(expected_units) * unit_price;

    let balance = lock_balance(&mut *conn, account_id).await?;
    if balance < total {
        return Err(AtelierError::insufficient_balance(total, balance));
    }

    let after = balance - total;
    write_balance(&mut *conn, account_id, after).await?;

    let entry = append_entry(
        &mut *conn,
        account_id,
        EntryCategory::JobCharge,
        total,
        balance,
        after,
        Some(job_id),
        None,
    )
    .await?;

    tracing::debug!(
        account_id = %account_id,
        job_id = %job_id,
        amount = total,
        balance_after = after,
        "Account charged for job"
    );

    Ok(entry)
}

/// Credit back the undelivered portion of a finished job.
///
/// Returns `Ok(None)` when nothing is owed. The original `job_charge` entry
/// must exist; a job that was never charged is an invariant violation and
/// aborts the enclosing transaction.
pub async fn refund(
    conn: &mut PgConnection,
    account_id: Uuid,
    job_id: Uuid,
    expected_units: i32,
    actual_units: i32,
) -> Result<Option<LedgerEntry>> {
    if i64::from(expected_units) - i64::from(actual_units) <= 0 {
        return Ok(None);
    }

    let charge_amount: Option<i64> = sqlx::query_scalar(
        "SELECT amount FROM ledger_entries WHERE job_id = $1 AND category = 'job_charge'",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    let charge_amount = charge_amount.ok_or_else(|| {
        AtelierError::internal(format!("job {} has no job_charge ledger entry", job_id))
    })?;

    let amount = refund_amount(charge_amount, expected_units, actual_units);
    if amount <= 0 {
        return Ok(None);
    }

    let balance = lock_balance(&mut *conn, account_id).await?;
    let after = balance + amount;
    write_balance(&mut *conn, account_id, after).await?;

    let entry = append_entry(
        &mut *conn,
        account_id,
        EntryCategory::JobRefund,
        amount,
        balance,
        after,
        Some(job_id),
        None,
    )
    .await?;

    tracing::info!(
        account_id = %account_id,
        job_id = %job_id,
        amount = amount,
        balance_after = after,
        "Job refund credited"
    );

    Ok(Some(entry))
}

/// Credit an account for a settled payment order.
///
/// Called only from the guarded `pending → success` transition.
pub async fn settle(
    conn: &mut PgConnection,
    account_id: Uuid,
    order_id: Uuid,
    amount: i64,
) -> Result<LedgerEntry> {
    let balance = lock_balance(&mut *conn, account_id).await?;
    let after = balance + amount;
    write_balance(&mut *conn, account_id, after).await?;

    let entry = append_entry(
        &mut *conn,
        account_id,
        EntryCategory::OrderSettlement,
        amount,
        balance,
        after,
        None,
        Some(order_id),
    )
    .await?;

    tracing::info!(
        account_id = %account_id,
        order_id = %order_id,
        amount = amount,
        balance_after = after,
        "Order settlement credited"
    );

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_roundtrip() {
        for category in [
            EntryCategory::JobCharge,
            EntryCategory::JobRefund,
            EntryCategory::OrderSettlement,
        ] {
            assert_eq!(EntryCategory::parse(category.as_str()), Some(category));
        }
        assert!(EntryCategory::JobCharge.is_debit());
        assert!(!EntryCategory::OrderSettlement.is_debit());
    }

    #[test]
    fn test_refund_amount_all_units_delivered() {
        // charge = 4 × 20 = 80, everything delivered: nothing owed
        assert_eq!(refund_amount(80, 4, 4), 0);
        assert_eq!(refund_amount(80, 4, 5), 0);
    }

    #[test]
    fn test_refund_amount_partial() {
        // 3 of 4 delivered: one unit (80 / 4 = 20) comes back
        assert_eq!(refund_amount(80, 4, 3), 20);
        // 1 of 4 delivered
        assert_eq!(refund_amount(80, 4, 1), 60);
    }

    #[test]
    fn test_refund_amount_total_failure_refunds_full_charge() {
        // Full failure refunds the charge verbatim, bypassing the per-unit
        // division so no remainder is lost.
        assert_eq!(refund_amount(80, 4, 0), 80);
        assert_eq!(refund_amount(10, 3, 0), 10);
    }

    #[test]
    fn test_refund_amount_integer_division_drift() {
        // charge 10 over 3 expected units: unit price rounds down to 3.
        // 1 delivered → refund 2 × 3 = 6, the remainder (1) stays charged.
        assert_eq!(refund_amount(10, 3, 1), 6);
        assert_eq!(refund_amount(10, 3, 2), 3);
    }
}
