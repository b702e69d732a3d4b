//! Payment order operations and the guarded settlement transition.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    new_merchant_order_id, OrderStatus, PaymentCredential, PaymentProvider, ProviderOrderStatus,
    SettlementNotice, WebhookHeaders, WebhookVerifier,
};
use crate::config::PaymentConfig;
use crate::db::{Database, PaymentOrderRow};
use crate::error::{AtelierError, ErrorCode, Result};
use crate::ledger;

// ═══════════════════════════════════════════════════════════════════════════════
// Views
// ═══════════════════════════════════════════════════════════════════════════════

/// Client-facing view of a payment order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub merchant_order_id: String,
    pub account_id: Uuid,
    pub amount: i64,
    pub provider: String,
    pub status: String,
    pub expire_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
}

impl From<PaymentOrderRow> for OrderView {
    fn from(row: PaymentOrderRow) -> Self {
        Self {
            merchant_order_id: row.merchant_order_id,
            account_id: row.account_id,
            amount: row.amount,
            provider: row.provider,
            status: row.status,
            expire_at: row.expire_at,
            settled_at: row.settled_at,
            external_transaction_id: row.external_transaction_id,
        }
    }
}

/// What a settlement attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The account was credited and the order marked `success`
    Settled,
    /// The order was already `success`; nothing was mutated
    AlreadySettled,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Order creation, webhook settlement, polling fallback, and user close.
pub struct PaymentService {
    db: Database,
    provider: Arc<dyn PaymentProvider>,
    verifier: Arc<WebhookVerifier>,
    provider_name: String,
    callback_url: String,
    order_ttl: chrono::Duration,
}

impl PaymentService {
    pub fn new(
        db: Database,
        provider: Arc<dyn PaymentProvider>,
        verifier: Arc<WebhookVerifier>,
        cfg: &PaymentConfig,
    ) -> Self {
        Self {
            db,
            provider,
            verifier,
            provider_name: cfg.provider_name.clone(),
            callback_url: cfg.callback_url.clone(),
            order_ttl: chrono::Duration::from_std(cfg.order_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Create
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a recharge order: unique merchant order id, provider
    /// credential, `pending` row with an expiry timestamp.
    pub async fn create_order(
        &self,
        account_id: Uuid,
        amount: i64,
    ) -> Result<(OrderView, PaymentCredential)> {
        if amount <= 0 {
            return Err(AtelierError::new(
                ErrorCode::AmountInvalid,
                "Order amount must be positive",
            ));
        }
        if self.db.get_account(account_id).await?.is_none() {
            return Err(AtelierError::not_found("account", account_id.to_string()));
        }

        let merchant_order_id = new_merchant_order_id();
        let expire_at = Utc::now() + self.order_ttl;

        let credential = self
            .provider
            .create_order(&merchant_order_id, amount, &self.callback_url)
            .await?;

        let row = self
            .db
            .insert_payment_order(
                account_id,
                amount,
                &self.provider_name,
                &merchant_order_id,
                expire_at,
            )
            .await?;

        tracing::info!(
            merchant_order_id = %row.merchant_order_id,
            account_id = %account_id,
            amount = amount,
            "Payment order created"
        );

        Ok((row.into(), credential))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Settle
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify, decrypt, and settle an inbound webhook notification.
    pub async fn handle_webhook(
        &self,
        headers: &WebhookHeaders,
        body: &str,
    ) -> Result<SettleOutcome> {
        let notice = self.verifier.verify_and_decrypt(headers, body)?;
        self.settle(&notice).await
    }

    /// The guarded `pending → success` transition. Safe to race: the order
    /// row lock plus status re-check make it idempotent no matter how many
    /// webhook deliveries and polling calls arrive concurrently.
    pub async fn settle(&self, notice: &SettlementNotice) -> Result<SettleOutcome> {
        let mut tx = self.db.pool().begin().await?;

        let order = sqlx::query_as::<_, PaymentOrderRow>(
            r#"
            SELECT id, account_id, amount, provider, merchant_order_id,
                   external_transaction_id, status, expire_at, settled_at,
                   linked_ledger_entry_id, created_at, updated_at
            FROM payment_orders
            WHERE merchant_order_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&notice.merchant_order_id)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some(order) = order else {
            return Err(AtelierError::not_found(
                "order",
                notice.merchant_order_id.clone(),
            ));
        };

        match order.status() {
            Some(OrderStatus::Success) => {
                // Duplicate delivery: report success, mutate nothing.
                tx.rollback().await?;
                counter!("atelier_settlements_total", "outcome" => "duplicate").increment(1);
                tracing::info!(
                    merchant_order_id = %order.merchant_order_id,
                    "Duplicate settlement delivery ignored"
                );
                return Ok(SettleOutcome::AlreadySettled);
            }
            Some(OrderStatus::Pending) => {}
            _ => {
                tx.rollback().await?;
                return Err(AtelierError::order_not_pending(
                    order.merchant_order_id.clone(),
                    &order.status,
                ));
            }
        }

        if notice.amount != order.amount {
            tx.rollback().await?;
            counter!("atelier_settlements_total", "outcome" => "amount_mismatch").increment(1);
            return Err(AtelierError::amount_mismatch(order.amount, notice.amount)
                .with_context("merchant_order_id", &order.merchant_order_id));
        }

        let entry =
            ledger::settle(tx.as_mut(), order.account_id, order.id, order.amount).await?;

        sqlx::query(
            r#"
            UPDATE payment_orders
            SET status = 'success',
                external_transaction_id = $2,
                settled_at = NOW(),
                linked_ledger_entry_id = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(&notice.external_transaction_id)
        .bind(entry.id)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        counter!("atelier_settlements_total", "outcome" => "settled").increment(1);
        tracing::info!(
            merchant_order_id = %order.merchant_order_id,
            account_id = %order.account_id,
            amount = order.amount,
            ledger_entry = %entry.id,
            "Payment order settled"
        );

        Ok(SettleOutcome::Settled)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status + Polling Fallback
    // ─────────────────────────────────────────────────────────────────────────

    /// Current order status. A still-`pending` order triggers an active
    /// provider query — the fallback for a lost or delayed webhook. A race
    /// with a concurrently arriving webhook is resolved by the guarded
    /// transition in [`settle`](Self::settle).
    pub async fn get_order_status(&self, merchant_order_id: &str) -> Result<OrderView> {
        let order = self
            .db
            .get_order_by_merchant_id(merchant_order_id)
            .await?
            .ok_or_else(|| AtelierError::not_found("order", merchant_order_id.to_string()))?;

        if order.status() != Some(OrderStatus::Pending) {
            return Ok(order.into());
        }

        let state = match self.provider.query_order(merchant_order_id).await {
            Ok(state) => state,
            Err(e) => {
                // The local row answers even when the provider is down.
                tracing::warn!(
                    merchant_order_id = merchant_order_id,
                    error = %e,
                    "Provider query failed, returning local status"
                );
                return Ok(order.into());
            }
        };

        match state.status {
            ProviderOrderStatus::Paid => {
                let notice = SettlementNotice {
                    merchant_order_id: merchant_order_id.to_string(),
                    external_transaction_id: state.transaction_id.unwrap_or_default(),
                    amount: order.amount,
                    paid_at: None,
                };
                self.settle(&notice).await?;
            }
            ProviderOrderStatus::PayError => {
                sqlx::query(
                    r#"
                    UPDATE payment_orders
                    SET status = 'failed', updated_at = NOW()
                    WHERE merchant_order_id = $1 AND status = 'pending'
                    "#,
                )
                .bind(merchant_order_id)
                .execute(self.db.pool())
                .await?;
            }
            ProviderOrderStatus::Closed => {
                self.db.close_order_if_pending(merchant_order_id).await?;
            }
            ProviderOrderStatus::NotPaid => {}
        }

        let refreshed = self
            .db
            .get_order_by_merchant_id(merchant_order_id)
            .await?
            .ok_or_else(|| AtelierError::not_found("order", merchant_order_id.to_string()))?;

        Ok(refreshed.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User Close
    // ─────────────────────────────────────────────────────────────────────────

    /// Close an order on user request. Rejected unless still `pending`.
    pub async fn close_order(&self, merchant_order_id: &str) -> Result<()> {
        let order = self
            .db
            .get_order_by_merchant_id(merchant_order_id)
            .await?
            .ok_or_else(|| AtelierError::not_found("order", merchant_order_id.to_string()))?;

        if !self.db.close_order_if_pending(merchant_order_id).await? {
            return Err(AtelierError::order_not_pending(
                merchant_order_id.to_string(),
                &order.status,
            ));
        }

        // Best effort at the provider; the local close already holds.
        if let Err(e) = self.provider.close_order(merchant_order_id).await {
            tracing::warn!(
                merchant_order_id = merchant_order_id,
                error = %e,
                "Provider close failed after local close"
            );
        }

        Ok(())
    }
}
