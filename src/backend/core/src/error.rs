//! Error handling for Atelier Core.
//!
//! This module provides:
//! - Machine-readable error codes for API responses
//! - HTTP status code mapping
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use atelier_core::error::{AtelierError, Result, ErrorContext};
//!
//! fn my_function() -> Result<()> {
//!     some_operation().context("Failed to perform operation")?;
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Atelier operations.
pub type Result<T> = std::result::Result<T, AtelierError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Billing Errors (1000-1099)
    InsufficientBalance,
    AmountInvalid,

    // Job Errors (1100-1199)
    JobNotFound,
    InvalidStateTransition,
    LockContention,

    // Payment Order Errors (1200-1299)
    OrderNotFound,
    OrderNotPending,
    AmountMismatch,
    DuplicateMerchantOrder,

    // Webhook Errors (1300-1399)
    SignatureVerificationFailed,
    ReplaySuspected,
    PayloadDecryptionFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Provider Errors (3000-3099)
    ProviderNetworkError,
    ProviderTimeout,
    ProviderRateLimited,
    ProviderUnavailable,
    ProviderRejected,
    UploadFailed,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Billing
            Self::InsufficientBalance => 1000,
            Self::AmountInvalid => 1001,

            // Job
            Self::JobNotFound => 1100,
            Self::InvalidStateTransition => 1101,
            Self::LockContention => 1102,

            // Payment Order
            Self::OrderNotFound => 1200,
            Self::OrderNotPending => 1201,
            Self::AmountMismatch => 1202,
            Self::DuplicateMerchantOrder => 1203,

            // Webhook
            Self::SignatureVerificationFailed => 1300,
            Self::ReplaySuspected => 1301,
            Self::PayloadDecryptionFailed => 1302,

            // Database
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DatabaseTransactionFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            // Serialization
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            // External Provider
            Self::ProviderNetworkError => 3000,
            Self::ProviderTimeout => 3001,
            Self::ProviderRateLimited => 3002,
            Self::ProviderUnavailable => 3003,
            Self::ProviderRejected => 3004,
            Self::UploadFailed => 3005,

            // Validation
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            // Configuration
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal
            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Payment Required (402)
            Self::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,

            // Not Found (404)
            Self::JobNotFound | Self::OrderNotFound | Self::RecordNotFound => {
                StatusCode::NOT_FOUND
            }

            // Conflict (409)
            Self::InvalidStateTransition
            | Self::LockContention
            | Self::OrderNotPending
            | Self::DuplicateMerchantOrder
            | Self::DuplicateRecord => StatusCode::CONFLICT,

            // Unauthorized (401)
            Self::SignatureVerificationFailed | Self::ReplaySuspected => {
                StatusCode::UNAUTHORIZED
            }

            // Unprocessable Entity (422)
            Self::AmountInvalid
            | Self::AmountMismatch
            | Self::ValidationError
            | Self::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,

            // Bad Request (400)
            Self::PayloadDecryptionFailed => StatusCode::BAD_REQUEST,

            // Too Many Requests (429)
            Self::ProviderRateLimited => StatusCode::TOO_MANY_REQUESTS,

            // Timeout (504)
            Self::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,

            // Bad Gateway (502)
            Self::ProviderNetworkError | Self::ProviderRejected | Self::UploadFailed => {
                StatusCode::BAD_GATEWAY
            }

            // Service Unavailable (503)
            Self::DatabaseConnectionFailed | Self::ProviderUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // Internal Server Error (500)
            Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::DatabaseTransactionFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderNetworkError
                | Self::ProviderTimeout
                | Self::ProviderRateLimited
                | Self::ProviderUnavailable
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "billing",
            1100..=1199 => "job",
            1200..=1299 => "order",
            1300..=1399 => "webhook",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            3000..=3099 => "provider",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, insufficient funds)
    Low,
    /// Operational issues (rate limits, timeouts, replays)
    Medium,
    /// System errors and anything needing manual review
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            // Low severity - expected user/runtime outcomes
            ErrorCode::InsufficientBalance
            | ErrorCode::AmountInvalid
            | ErrorCode::JobNotFound
            | ErrorCode::OrderNotFound
            | ErrorCode::OrderNotPending
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::DuplicateMerchantOrder
            | ErrorCode::InvalidStateTransition
            | ErrorCode::LockContention
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput => Self::Low,

            // Medium severity - operational
            ErrorCode::ProviderRateLimited
            | ErrorCode::ProviderTimeout
            | ErrorCode::ProviderUnavailable
            | ErrorCode::ReplaySuspected => Self::Medium,

            // High severity - system errors and manual-review cases.
            // AmountMismatch and signature failures are kept for review.
            ErrorCode::AmountMismatch
            | ErrorCode::SignatureVerificationFailed
            | ErrorCode::PayloadDecryptionFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::DatabaseTransactionFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ProviderNetworkError
            | ErrorCode::ProviderRejected
            | ErrorCode::UploadFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            // Critical severity
            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, order, account)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Atelier Core.
///
/// Supports structured error codes for API responses, user-friendly vs
/// internal messages, HTTP status code mapping, and metrics integration.
#[derive(Error, Debug)]
pub struct AtelierError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AtelierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl AtelierError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let code = match entity_type.as_str() {
            "job" => ErrorCode::JobNotFound,
            "order" => ErrorCode::OrderNotFound,
            _ => ErrorCode::RecordNotFound,
        };
        Self::new(code, format!("{} not found: {}", entity_type, entity_id))
            .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Domain Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Balance too low to cover a job charge. No job is created.
    pub fn insufficient_balance(required: i64, available: i64) -> Self {
        Self::new(
            ErrorCode::InsufficientBalance,
            "Account balance is insufficient for this job",
        )
        .with_context("required", required)
        .with_context("available", available)
    }

    /// Another worker or claimer owns the row. Callers skip silently; this
    /// error never reaches a client.
    pub fn lock_contention(entity: impl Into<String>, id: impl Into<String>) -> Self {
        let entity = entity.into();
        let id = id.into();
        Self::new(
            ErrorCode::LockContention,
            format!("{} {} is owned by another worker", entity, id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity, &id))
    }

    /// An order transition was attempted from a non-pending state.
    pub fn order_not_pending(merchant_order_id: impl Into<String>, status: &str) -> Self {
        Self::new(
            ErrorCode::OrderNotPending,
            format!("Order is not pending (current status: {})", status),
        )
        .with_details(ErrorDetails::new().with_entity("order", merchant_order_id.into()))
    }

    /// A webhook reported an amount that does not match the order.
    pub fn amount_mismatch(expected: i64, reported: i64) -> Self {
        Self::new(
            ErrorCode::AmountMismatch,
            "Settled amount does not match the order amount",
        )
        .with_context("expected", expected)
        .with_context("reported", reported)
    }

    /// Webhook signature verification failed. The internal reason is never
    /// exposed to the caller.
    pub fn signature_verification_failed(internal_reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::SignatureVerificationFailed,
            "Webhook verification failed",
            internal_reason,
        )
    }

    /// Webhook timestamp is outside the freshness window.
    pub fn replay_suspected(skew_secs: i64) -> Self {
        Self::with_internal(
            ErrorCode::ReplaySuspected,
            "Webhook verification failed",
            format!("timestamp skew of {}s exceeds freshness window", skew_secs),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "atelier_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&AtelierError> for ErrorResponse {
    fn from(error: &AtelierError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.context.is_empty()
                    && error.details.entity_id.is_none()
                    && error.details.retry_after_secs.is_none()
                {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for AtelierError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| AtelierError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| AtelierError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AtelierError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| AtelierError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for AtelierError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                // 55P03 = lock_not_available, raised by FOR UPDATE NOWAIT when
                // another worker holds the row.
                if db_err.code().as_deref() == Some("55P03") {
                    return Self::with_internal(
                        ErrorCode::LockContention,
                        "Row is locked by another worker",
                        db_err.to_string(),
                    )
                    .with_source(error);
                }
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("merchant_order_id") {
                        return Self::with_internal(
                            ErrorCode::DuplicateMerchantOrder,
                            "An order with this merchant order id already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for AtelierError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for AtelierError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (
                ErrorCode::ProviderTimeout,
                "External service request timed out",
            )
        } else if error.is_connect() {
            (
                ErrorCode::ProviderNetworkError,
                "Failed to connect to external service",
            )
        } else if error.is_status() {
            match error.status().map(|s| s.as_u16()) {
                Some(429) => (
                    ErrorCode::ProviderRateLimited,
                    "Rate limited by external service",
                ),
                Some(500..=599) => (
                    ErrorCode::ProviderUnavailable,
                    "External service is temporarily unavailable",
                ),
                _ => (
                    ErrorCode::ProviderRejected,
                    "External service rejected the request",
                ),
            }
        } else {
            (ErrorCode::ProviderNetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::sync::AcquireError> for AtelierError {
    fn from(error: tokio::sync::AcquireError) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "Resource acquisition failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for AtelierError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::ProviderTimeout,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for AtelierError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::ProviderTimeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::ProviderNetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for AtelierError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<AtelierError>() {
            Ok(atelier_error) => atelier_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for AtelierError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(
            ErrorCode::InsufficientBalance.http_status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::OrderNotPending.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::SignatureVerificationFailed.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorCode::ProviderRateLimited.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::ProviderRateLimited.is_retryable());
        assert!(ErrorCode::ProviderTimeout.is_retryable());
        assert!(ErrorCode::ProviderUnavailable.is_retryable());
        assert!(!ErrorCode::ProviderRejected.is_retryable());
        assert!(!ErrorCode::InsufficientBalance.is_retryable());
        assert!(!ErrorCode::AmountMismatch.is_retryable());
    }

    #[test]
    fn test_insufficient_balance_error() {
        let error = AtelierError::insufficient_balance(80, 50);
        assert_eq!(error.code(), ErrorCode::InsufficientBalance);
        assert_eq!(error.http_status(), StatusCode::PAYMENT_REQUIRED);
        assert!(error.details().context.contains_key("required"));
        assert!(error.details().context.contains_key("available"));
    }

    #[test]
    fn test_signature_failure_hides_internals() {
        let error =
            AtelierError::signature_verification_failed("hmac mismatch for serial PLAT-1");
        // The user-facing message never carries the internal reason.
        assert_eq!(error.user_message(), "Webhook verification failed");
        assert!(error.internal_message().unwrap().contains("PLAT-1"));

        let response = ErrorResponse::from(&error);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("hmac"));
        assert!(!json.contains("PLAT-1"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InsufficientBalance),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ReplaySuspected),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::AmountMismatch),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let error = AtelierError::validation("Unit count must be positive");
        let response = ErrorResponse::from(&error);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("VALIDATION_ERROR"));
        assert!(json.contains("Unit count must be positive"));
    }

    #[test]
    fn test_error_display() {
        let error = AtelierError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Connection refused"));
    }
}
