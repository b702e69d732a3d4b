//! Payment provider API — a consumed interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PaymentConfig;
use crate::error::{AtelierError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque payment credential handed to the storefront UI (QR code payload
/// or redirect URL — this core never interprets it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCredential {
    pub credential: String,
}

/// Order status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderOrderStatus {
    /// Payment completed at the provider
    Paid,
    /// Still awaiting payment
    NotPaid,
    /// Closed at the provider (expired or cancelled)
    Closed,
    /// Payment attempted and failed
    PayError,
}

/// Provider-side view of an order, as returned by the query API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderOrderState {
    pub status: ProviderOrderStatus,
    /// Provider transaction id, present once the order was paid
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Provider API surface used by order creation, the polling fallback, and
/// the expiry sweep.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create an order at the provider; returns the payment credential.
    async fn create_order(
        &self,
        merchant_order_id: &str,
        amount: i64,
        callback_url: &str,
    ) -> Result<PaymentCredential>;

    /// Query the provider-side status of an order.
    async fn query_order(&self, merchant_order_id: &str) -> Result<ProviderOrderState>;

    /// Close an unpaid order at the provider.
    ///
    /// Implementations must treat "already closed" as success and report
    /// "already paid" via `ProviderOrderStatus::Paid` so the sweep leaves
    /// the order to the settlement paths.
    async fn close_order(&self, merchant_order_id: &str) -> Result<ProviderOrderStatus>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// reqwest-backed provider client.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    merchant_id: String,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    merchant_id: &'a str,
    merchant_order_id: &'a str,
    amount: i64,
    notify_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CloseOrderResponse {
    status: ProviderOrderStatus,
}

impl HttpPaymentProvider {
    pub fn new(cfg: &PaymentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(AtelierError::from)?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            merchant_id: cfg.merchant_id.clone(),
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_order(
        &self,
        merchant_order_id: &str,
        amount: i64,
        callback_url: &str,
    ) -> Result<PaymentCredential> {
        let url = format!("{}/orders", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&CreateOrderRequest {
                merchant_id: &self.merchant_id,
                merchant_order_id,
                amount,
                notify_url: callback_url,
            })
            .send()
            .await?
            .error_for_status()?;

        let credential: PaymentCredential = response.json().await?;
        Ok(credential)
    }

    async fn query_order(&self, merchant_order_id: &str) -> Result<ProviderOrderState> {
        let url = format!("{}/orders/{}", self.base_url, merchant_order_id);

        let response = self.client.get(&url).send().await?.error_for_status()?;

        let parsed: ProviderOrderState = response.json().await?;
        Ok(parsed)
    }

    async fn close_order(&self, merchant_order_id: &str) -> Result<ProviderOrderStatus> {
        let url = format!("{}/orders/{}/close", self.base_url, merchant_order_id);

        let response = self.client.post(&url).send().await?;

        // The provider answers close attempts on finished orders with the
        // order's state instead of an error; only transport-level failures
        // propagate.
        let response = response.error_for_status()?;
        let parsed: CloseOrderResponse = response.json().await?;
        Ok(parsed.status)
    }
}
