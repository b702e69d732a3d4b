//! Account management commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create a new account
    Create,

    /// Show an account's balance
    Show {
        /// Account ID
        account_id: Uuid,
    },

    /// Show an account's ledger entries
    Ledger {
        /// Account ID
        account_id: Uuid,

        /// Maximum number of entries
        #[arg(short, long, default_value = "100")]
        limit: u32,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct AccountInfo {
    id: Uuid,
    balance: i64,
    created_at: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct LedgerEntryInfo {
    id: Uuid,
    category: String,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    job_id: Option<Uuid>,
    order_id: Option<Uuid>,
    created_at: String,
}

#[derive(Debug, Serialize, Tabled)]
struct LedgerRow {
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Amount")]
    amount: i64,
    #[tabled(rename = "Before")]
    balance_before: i64,
    #[tabled(rename = "After")]
    balance_after: i64,
    #[tabled(rename = "Reference")]
    reference: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

pub async fn execute(
    cmd: AccountCommands,
    client: &ApiClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        AccountCommands::Create => {
            let account: AccountInfo = client
                .post("/api/v1/accounts", &serde_json::json!({}))
                .await?;
            output::print_success(&format!("Account created: {}", account.id));
            output::print_item(&account, format);
        }
        AccountCommands::Show { account_id } => {
            let account: AccountInfo =
                client.get(&format!("/api/v1/accounts/{}", account_id)).await?;
            output::print_item(&account, format);
        }
        AccountCommands::Ledger { account_id, limit } => {
            let entries: Vec<LedgerEntryInfo> = client
                .get(&format!(
                    "/api/v1/accounts/{}/ledger?limit={}",
                    account_id, limit
                ))
                .await?;

            let rows: Vec<LedgerRow> = entries
                .iter()
                .map(|e| LedgerRow {
                    category: e.category.clone(),
                    amount: e.amount,
                    balance_before: e.balance_before,
                    balance_after: e.balance_after,
                    reference: e
                        .job_id
                        .map(|id| format!("job:{}", id))
                        .or_else(|| e.order_id.map(|id| format!("order:{}", id)))
                        .unwrap_or_default(),
                    created_at: e.created_at.clone(),
                })
                .collect();

            output::print_list(&rows, format);
        }
    }

    Ok(())
}
