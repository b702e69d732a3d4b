//! API request handlers.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::AtelierError;
use crate::jobs::{JobSpec, UnitError};
use crate::ledger::LedgerEntry;
use crate::payments::{OrderView, WebhookHeaders};

// ═══════════════════════════════════════════════════════════════════════════════
// Health + Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Account Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub balance: i64,
    pub created_at: String,
}

pub async fn create_account(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AtelierError> {
    let account = state.engine.db().create_account().await?;

    let response = AccountResponse {
        id: account.id,
        balance: account.balance,
        created_at: account.created_at.to_rfc3339(),
    };

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(response)),
    ))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AtelierError> {
    let account = state
        .engine
        .db()
        .get_account(id)
        .await?
        .ok_or_else(|| AtelierError::not_found("account", id.to_string()))?;

    Ok(Json(ApiResponse::success(AccountResponse {
        id: account.id,
        balance: account.balance,
        created_at: account.created_at.to_rfc3339(),
    })))
}

#[derive(Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<i64>,
}

pub async fn get_account_ledger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LedgerQuery>,
) -> Result<impl IntoResponse, AtelierError> {
    if state.engine.db().get_account(id).await?.is_none() {
        return Err(AtelierError::not_found("account", id.to_string()));
    }

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let entries: Vec<LedgerEntry> = state.engine.db().get_ledger_entries(id, limit).await?;

    Ok(Json(ApiResponse::success(entries)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub account_id: Uuid,
    pub spec: JobSpec,
    pub expected_unit_count: i32,
    /// Minor currency units per generated image, resolved by the catalog
    /// layer upstream of this core.
    pub unit_price: i64,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: String,
    pub expected_unit_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_unit_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unit_errors: Vec<UnitError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub result_urls: Vec<String>,
    pub created_at: String,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, AtelierError> {
    if req.expected_unit_count <= 0 {
        return Err(AtelierError::validation("expected_unit_count must be positive"));
    }
    if req.unit_price <= 0 {
        return Err(AtelierError::validation("unit_price must be positive"));
    }
    if req.spec.prompt().trim().is_empty() {
        return Err(AtelierError::validation("prompt cannot be empty"));
    }

    // One generation call per billed unit.
    let batch_count = req.expected_unit_count;

    let job = state
        .engine
        .db()
        .create_job_with_charge(
            req.account_id,
            &req.spec,
            req.expected_unit_count,
            batch_count,
            req.unit_price,
        )
        .await?;

    let response = JobResponse {
        id: job.id,
        status: job.status.clone(),
        expected_unit_count: job.expected_unit_count,
        actual_unit_count: job.actual_unit_count,
        error_summary: None,
        unit_errors: Vec::new(),
        result_urls: Vec::new(),
        created_at: job.created_at.to_rfc3339(),
    };

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(response)),
    ))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AtelierError> {
    let job = state
        .engine
        .db()
        .get_job(id)
        .await?
        .ok_or_else(|| AtelierError::not_found("job", id.to_string()))?;

    let response = JobResponse {
        id: job.id,
        status: job.status.clone(),
        expected_unit_count: job.expected_unit_count,
        actual_unit_count: job.actual_unit_count,
        error_summary: job.error_summary.clone(),
        unit_errors: job.parse_unit_errors(),
        result_urls: job.parse_result_urls(),
        created_at: job.created_at.to_rfc3339(),
    };

    Ok(Json(ApiResponse::success(response)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payment Order Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub account_id: Uuid,
    /// Recharge amount in minor currency units
    pub amount: i64,
}

#[derive(Serialize)]
pub struct CreateOrderResponse {
    pub order: OrderView,
    /// Opaque payment credential (QR payload / redirect URL)
    pub credential: String,
}

pub async fn create_payment_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, AtelierError> {
    let (order, credential) = state
        .engine
        .payments()
        .create_order(req.account_id, req.amount)
        .await?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(CreateOrderResponse {
            order,
            credential: credential.credential,
        })),
    ))
}

/// Order status readback. A still-pending order triggers the polling
/// fallback against the provider before answering.
pub async fn get_payment_order_status(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<impl IntoResponse, AtelierError> {
    let view = state
        .engine
        .payments()
        .get_order_status(&merchant_order_id)
        .await?;

    Ok(Json(ApiResponse::success(view)))
}

pub async fn close_payment_order(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<impl IntoResponse, AtelierError> {
    state
        .engine
        .payments()
        .close_order(&merchant_order_id)
        .await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "merchant_order_id": merchant_order_id,
        "status": "closed",
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payment Webhook
// ═══════════════════════════════════════════════════════════════════════════════

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, AtelierError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            AtelierError::signature_verification_failed(format!("missing header {}", name))
        })
}

/// Inbound settlement notification: raw signed body, signature material in
/// headers. Internal verification details are logged, never echoed back.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AtelierError> {
    let webhook_headers = WebhookHeaders {
        timestamp: required_header(&headers, "Pay-Timestamp")?,
        nonce: required_header(&headers, "Pay-Nonce")?,
        serial: required_header(&headers, "Pay-Serial")?,
        signature: required_header(&headers, "Pay-Signature")?,
    };

    // Both fresh settlement and a duplicate delivery acknowledge with
    // SUCCESS so the provider stops redelivering.
    state
        .engine
        .payments()
        .handle_webhook(&webhook_headers, &body)
        .await?;

    Ok(Json(serde_json::json!({ "code": "SUCCESS" })))
}
