//! Expiry sweep: closes pending orders whose payment window has passed.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;

use super::{PaymentProvider, ProviderOrderStatus};
use crate::db::{Database, PaymentOrderRow};
use crate::error::Result;

/// Periodic sweep over `pending` orders past `expire_at`.
///
/// Uses the same skip-locked claim pattern as the job scheduler, so any
/// number of sweeper replicas divide the expired rows without coordination.
pub struct ExpirySweeper {
    db: Database,
    provider: Arc<dyn PaymentProvider>,
    interval: Duration,
    batch_size: i64,
}

/// Handle for stopping a running sweeper.
pub struct ExpirySweeperHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ExpirySweeperHandle {
    /// Signal the sweeper to stop and wait for the loop to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl ExpirySweeper {
    pub fn new(
        db: Database,
        provider: Arc<dyn PaymentProvider>,
        interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            db,
            provider,
            interval,
            batch_size,
        }
    }

    /// Start the sweep loop.
    pub fn start(self) -> ExpirySweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.interval.as_secs(),
                "Order expiry sweeper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // A failed sweep aborts this tick only; ownership
                        // lives in row state, so nothing is lost.
                        match self.sweep_once().await {
                            Ok(0) => {}
                            Ok(closed) => {
                                tracing::info!(closed = closed, "Expired orders closed");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Expiry sweep failed");
                            }
                        }
                    }
                }
            }

            tracing::info!("Order expiry sweeper stopped");
        });

        ExpirySweeperHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Run one sweep: claim expired pending orders with `SKIP LOCKED`, close
    /// each at the provider, and mark them closed locally.
    pub async fn sweep_once(&self) -> Result<u32> {
        let mut tx = self.db.pool().begin().await?;

        let expired = sqlx::query_as::<_, PaymentOrderRow>(
            r#"
            SELECT id, account_id, amount, provider, merchant_order_id,
                   external_transaction_id, status, expire_at, settled_at,
                   linked_ledger_entry_id, created_at, updated_at
            FROM payment_orders
            WHERE status = 'pending' AND expire_at < NOW()
            ORDER BY expire_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.batch_size)
        .fetch_all(tx.as_mut())
        .await?;

        let mut closed = 0u32;

        for order in &expired {
            match self.provider.close_order(&order.merchant_order_id).await {
                // The provider already took the payment: leave the row
                // pending for the webhook / polling settlement paths.
                Ok(ProviderOrderStatus::Paid) => {
                    tracing::warn!(
                        merchant_order_id = %order.merchant_order_id,
                        "Expired order was paid at the provider, leaving for settlement"
                    );
                }
                // Closed now, or already closed — either way we can close
                // the local row.
                Ok(_) => {
                    sqlx::query(
                        r#"
                        UPDATE payment_orders
                        SET status = 'closed', updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(order.id)
                    .execute(tx.as_mut())
                    .await?;
                    closed += 1;
                }
                Err(e) => {
                    // Keep the row pending; the next sweep retries.
                    tracing::warn!(
                        merchant_order_id = %order.merchant_order_id,
                        error = %e,
                        "Provider close failed during expiry sweep"
                    );
                }
            }
        }

        tx.commit().await?;

        if closed > 0 {
            counter!("atelier_orders_expired_total").increment(u64::from(closed));
        }

        Ok(closed)
    }
}
