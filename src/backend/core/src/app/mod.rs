//! Application context.
//!
//! [`Engine`] is the single composition point: every shared component (the
//! database, the one process-wide rate-limited generation client, the object
//! store, the payment provider and service) is constructed here at startup
//! and passed down explicitly — no module-level singletons. The periodic
//! machinery (claim loop, recovery sweep, expiry sweep, worker pool) has an
//! explicit start/stop lifecycle owned by this type.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::generation::{GenerationClient, HttpImageGenerator, ImageGenerator};
use crate::jobs::{JobScheduler, JobWorker, SchedulerHandle, WorkerHandle};
use crate::payments::{
    ExpirySweeper, ExpirySweeperHandle, HttpPaymentProvider, PaymentProvider, PaymentService,
    WebhookVerifier,
};
use crate::storage::{HttpObjectStore, ObjectStore};

/// Handles of the running background machinery.
struct RunningTasks {
    scheduler: SchedulerHandle,
    worker: WorkerHandle,
    expiry: ExpirySweeperHandle,
}

/// The application engine: shared components plus lifecycle control.
pub struct Engine {
    config: Config,
    db: Database,
    generation: Arc<GenerationClient>,
    store: Arc<dyn ObjectStore>,
    provider: Arc<dyn PaymentProvider>,
    payments: Arc<PaymentService>,
    running: Mutex<Option<RunningTasks>>,
}

impl Engine {
    /// Build the engine with the default HTTP-backed external interfaces.
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let generator: Arc<dyn ImageGenerator> =
            Arc::new(HttpImageGenerator::new(&config.generation)?);
        let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(&config.storage)?);
        let provider: Arc<dyn PaymentProvider> =
            Arc::new(HttpPaymentProvider::new(&config.payment)?);

        Self::with_interfaces(config, db, generator, store, provider)
    }

    /// Build the engine around explicit external-interface implementations.
    ///
    /// This is the seam tests and alternative deployments use to swap the
    /// generation API, object store, or payment provider.
    pub fn with_interfaces(
        config: Config,
        db: Database,
        generator: Arc<dyn ImageGenerator>,
        store: Arc<dyn ObjectStore>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Result<Self> {
        let generation = Arc::new(GenerationClient::from_config(generator, &config.generation));

        let verifier = Arc::new(WebhookVerifier::new(&config.payment)?);
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            provider.clone(),
            verifier,
            &config.payment,
        ));

        Ok(Self {
            config,
            db,
            generation,
            store,
            provider,
            payments,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn payments(&self) -> &Arc<PaymentService> {
        &self.payments
    }

    /// Start the scheduler, worker pool, and expiry sweep.
    ///
    /// The dispatch channel between scheduler and worker is bounded: the
    /// claim loop never waits on job execution, and anything beyond the
    /// buffer stays in row state for the recovery sweep. Sizing it to hold a
    /// full claim batch keeps that path exceptional.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!("Engine already started");
            return;
        }

        let queue_capacity = (self.config.scheduler.claim_batch_size.max(1) as usize)
            .max(self.config.worker.job_concurrency.max(1) * 2);
        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(queue_capacity);

        let scheduler = JobScheduler::new(
            self.db.clone(),
            self.config.scheduler.clone(),
            dispatch_tx,
        )
        .start();

        let worker = JobWorker::new(
            self.db.clone(),
            self.generation.clone(),
            self.store.clone(),
            self.config.worker.clone(),
        )
        .start(dispatch_rx);

        let expiry = ExpirySweeper::new(
            self.db.clone(),
            self.provider.clone(),
            self.config.payment.expiry_interval,
            self.config.payment.expiry_batch_size,
        )
        .start();

        *running = Some(RunningTasks {
            scheduler,
            worker,
            expiry,
        });

        tracing::info!("Engine started");
    }

    /// Stop the background machinery: loops first (no new claims), then the
    /// worker drain.
    pub async fn shutdown(&self) {
        let tasks = self.running.lock().take();
        let Some(tasks) = tasks else {
            return;
        };

        tasks.scheduler.shutdown().await;
        tasks.expiry.shutdown().await;
        tasks.worker.shutdown().await;

        tracing::info!("Engine stopped");
    }
}
