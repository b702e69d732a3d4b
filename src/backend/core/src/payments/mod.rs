//! Payment order lifecycle.
//!
//! One [`PaymentOrder`] per recharge attempt. Orders start `pending` and
//! reach exactly one terminal state:
//!
//! ```text
//! pending ──▶ success   (webhook or polling fallback, exactly once)
//!         ──▶ failed    (provider reports failure)
//!         ──▶ closed    (expiry sweep or user cancel)
//! ```
//!
//! No transition ever leaves a terminal state. The `pending → success`
//! transition is guarded by a row lock plus status re-check inside one
//! database transaction, which is what makes settlement idempotent under
//! concurrent webhook delivery and polling.

pub mod expiry;
pub mod provider;
pub mod service;
pub mod webhook;

pub use expiry::{ExpirySweeper, ExpirySweeperHandle};
pub use provider::{
    HttpPaymentProvider, PaymentCredential, PaymentProvider, ProviderOrderState,
    ProviderOrderStatus,
};
pub use service::{OrderView, PaymentService, SettleOutcome};
pub use webhook::{SettlementNotice, WebhookHeaders, WebhookVerifier};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Order Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a payment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Awaiting payment
    Pending,
    /// Settled; the account was credited exactly once
    Success,
    /// The provider reported the payment failed
    Failed,
    /// Expired or cancelled before payment
    Closed,
}

impl OrderStatus {
    /// Check if the order is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Merchant Order Ids
// ═══════════════════════════════════════════════════════════════════════════════

/// Generate a globally unique merchant order id.
///
/// The provider keys everything on this id, so it must never collide across
/// replicas or restarts.
pub fn new_merchant_order_id() -> String {
    format!("MO{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Success,
            OrderStatus::Failed,
            OrderStatus::Closed,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("refunded"), None);
    }

    #[test]
    fn test_only_pending_is_non_terminal() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Success.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Closed.is_terminal());
    }

    #[test]
    fn test_merchant_order_ids_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| new_merchant_order_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.starts_with("MO")));
    }
}
