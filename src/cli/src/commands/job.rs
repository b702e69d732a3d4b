//! Generation job commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Create a generation job (charges the account up front)
    Create {
        /// Account to charge
        #[arg(short, long)]
        account: Uuid,

        /// Generation prompt
        #[arg(short, long)]
        prompt: String,

        /// Number of images to generate
        #[arg(short, long, default_value = "1")]
        count: i32,

        /// Price per image in minor currency units
        #[arg(short, long)]
        unit_price: i64,

        /// Output size
        #[arg(short, long, default_value = "1024x1024")]
        size: String,

        /// Reference image URLs (switches to image-to-image)
        #[arg(short, long)]
        reference: Vec<String>,
    },

    /// Get job status
    Status {
        /// Job ID
        job_id: Uuid,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateJobRequest {
    account_id: Uuid,
    spec: serde_json::Value,
    expected_unit_count: i32,
    unit_price: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: Uuid,
    status: String,
    expected_unit_count: i32,
    #[serde(default)]
    actual_unit_count: Option<i32>,
    #[serde(default)]
    error_summary: Option<String>,
    #[serde(default)]
    unit_errors: Vec<serde_json::Value>,
    #[serde(default)]
    result_urls: Vec<String>,
    #[serde(default)]
    created_at: String,
}

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Create {
            account,
            prompt,
            count,
            unit_price,
            size,
            reference,
        } => {
            let spec = if reference.is_empty() {
                serde_json::json!({
                    "category": "text_to_image",
                    "prompt": prompt,
                    "size": size,
                })
            } else {
                serde_json::json!({
                    "category": "image_to_image",
                    "prompt": prompt,
                    "reference_images": reference,
                    "size": size,
                })
            };

            let request = CreateJobRequest {
                account_id: account,
                spec,
                expected_unit_count: count,
                unit_price,
            };

            let job: JobInfo = client.post("/api/v1/jobs", &request).await?;
            output::print_success(&format!(
                "Job created: {} ({} unit(s), {} charged)",
                job.id,
                job.expected_unit_count,
                i64::from(count) * unit_price
            ));
            output::print_item(&job, format);
        }
        JobCommands::Status { job_id } => {
            let job: JobInfo = client.get(&format!("/api/v1/jobs/{}", job_id)).await?;

            output::print_item(&job, format);
            if let Some(summary) = &job.error_summary {
                output::print_detail("errors", summary);
            }
        }
    }

    Ok(())
}
