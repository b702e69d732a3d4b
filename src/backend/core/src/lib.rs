#![allow(clippy::result_large_err)]
//! # Atelier Core
//!
//! The transactional job & payment order lifecycle engine behind an AI
//! image-generation storefront.
//!
//! ## Architecture
//!
//! - **Task Scheduler**: periodic skip-locked claim of pending jobs plus a
//!   stalled-job recovery sweep; safe across any number of replicas
//! - **Worker Queue**: bounded-concurrency execution of claimed jobs
//!   (generate → upload → settle) with heartbeats and guaranteed
//!   cancellation
//! - **Rate-Limited Retry Client**: one process-wide token bucket, per-call
//!   hard timeouts, and classified retry with backoff + jitter around the
//!   external generation API
//! - **Financial Ledger**: atomic debit/credit primitives with an immutable
//!   entry chain per account
//! - **Payment Order State Machine**: order creation, verified webhook
//!   settlement, polling fallback, and expiry closing with exactly-once
//!   crediting
//!
//! PostgreSQL is the only coordination substrate: row locks and skip-locked
//! claims replace any external lock service.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod jobs;
pub mod ledger;
pub mod observability;
pub mod payments;
pub mod storage;

pub use error::{AtelierError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::Engine;
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{AtelierError, ErrorCode, ErrorContext, Result};
    pub use crate::generation::{
        GenerationClient, GenerationRequest, ImageGenerator, RateLimiter, RetryPolicy, UnitOutcome,
    };
    pub use crate::jobs::{JobId, JobScheduler, JobSpec, JobStatus, JobWorker, UnitError};
    pub use crate::ledger::{EntryCategory, LedgerEntry};
    pub use crate::payments::{
        OrderStatus, PaymentProvider, PaymentService, SettleOutcome, SettlementNotice,
        WebhookVerifier,
    };
    pub use crate::storage::ObjectStore;
}
