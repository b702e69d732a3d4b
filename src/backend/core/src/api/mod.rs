//! HTTP API exposed to the storefront UI layer.
//!
//! Everything the excluded UI needs from this core: account helpers, job
//! creation/status, payment order creation/status/close, and the provider's
//! webhook endpoint. Handlers return `Result<impl IntoResponse,
//! AtelierError>` so errors map to HTTP status codes through the
//! `IntoResponse` implementation on `AtelierError`.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::Engine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub metrics: PrometheusHandle,
}

/// Uniform success envelope for API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/accounts", post(handlers::create_account))
        .route("/accounts/:id", get(handlers::get_account))
        .route("/accounts/:id/ledger", get(handlers::get_account_ledger))
        .route("/jobs", post(handlers::create_job))
        .route("/jobs/:id", get(handlers::get_job_status))
        .route("/orders", post(handlers::create_payment_order))
        .route(
            "/orders/:merchant_order_id",
            get(handlers::get_payment_order_status),
        )
        .route(
            "/orders/:merchant_order_id/close",
            post(handlers::close_payment_order),
        )
        .route("/payments/webhook", post(handlers::payment_webhook));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
