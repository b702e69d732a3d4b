//! Payment order commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum OrderCommands {
    /// Create a recharge order
    Create {
        /// Account to credit once the order settles
        #[arg(short, long)]
        account: Uuid,

        /// Recharge amount in minor currency units
        #[arg(long)]
        amount: i64,
    },

    /// Get order status (triggers the provider polling fallback while the
    /// order is still pending)
    Status {
        /// Merchant order ID
        merchant_order_id: String,
    },

    /// Close a pending order
    Close {
        /// Merchant order ID
        merchant_order_id: String,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct OrderInfo {
    merchant_order_id: String,
    account_id: Uuid,
    amount: i64,
    provider: String,
    status: String,
    expire_at: String,
    #[serde(default)]
    settled_at: Option<String>,
    #[serde(default)]
    external_transaction_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CreateOrderInfo {
    order: OrderInfo,
    credential: String,
}

pub async fn execute(cmd: OrderCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        OrderCommands::Create { account, amount } => {
            let created: CreateOrderInfo = client
                .post(
                    "/api/v1/orders",
                    &serde_json::json!({ "account_id": account, "amount": amount }),
                )
                .await?;

            output::print_success(&format!(
                "Order created: {} (expires {})",
                created.order.merchant_order_id, created.order.expire_at
            ));
            output::print_detail("credential", &created.credential);
            output::print_item(&created.order, format);
        }
        OrderCommands::Status { merchant_order_id } => {
            let order: OrderInfo = client
                .get(&format!("/api/v1/orders/{}", merchant_order_id))
                .await?;
            output::print_item(&order, format);
        }
        OrderCommands::Close { merchant_order_id } => {
            let result: serde_json::Value = client
                .post_empty(&format!("/api/v1/orders/{}/close", merchant_order_id))
                .await?;
            output::print_success(&format!("Order closed: {}", merchant_order_id));
            output::print_item(&result, format);
        }
    }

    Ok(())
}
