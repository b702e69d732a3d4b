//! Job scheduling: the claim loop and the stalled-job recovery sweep.

use metrics::counter;
use tokio::sync::mpsc;

use super::JobId;
use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::Result;

/// Claims pending jobs on a fixed interval and dispatches them to the
/// worker queue; a second timer returns stalled `processing` jobs to
/// `pending`.
///
/// Both queries use the skip-locked claim, so any number of scheduler
/// replicas can run against the same database: ownership is a property of
/// row state, and concurrently claimed sets are always disjoint.
pub struct JobScheduler {
    db: Database,
    config: SchedulerConfig,
    dispatch: mpsc::Sender<JobId>,
}

/// Handle for stopping a running scheduler.
pub struct SchedulerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    claim_loop: tokio::task::JoinHandle<()>,
    recovery_loop: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal both loops to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.claim_loop.await;
        let _ = self.recovery_loop.await;
    }
}

impl JobScheduler {
    pub fn new(db: Database, config: SchedulerConfig, dispatch: mpsc::Sender<JobId>) -> Self {
        Self {
            db,
            config,
            dispatch,
        }
    }

    /// Start the claim loop and the recovery sweep.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let claimer = ClaimLoop {
            db: self.db.clone(),
            config: self.config.clone(),
            dispatch: self.dispatch.clone(),
        };
        let mut claim_shutdown = shutdown_rx.clone();
        let claim_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(claimer.config.claim_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = claimer.config.claim_interval.as_secs(),
                batch_size = claimer.config.claim_batch_size,
                "Job claim loop started"
            );

            loop {
                tokio::select! {
                    _ = claim_shutdown.changed() => {
                        if *claim_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // A failed tick is logged and dropped; the next tick
                        // retries. No job is lost because claimed state lives
                        // in the row.
                        if let Err(e) = claimer.claim_tick().await {
                            tracing::warn!(error = %e, "Job claim tick failed");
                        }
                    }
                }
            }

            tracing::info!("Job claim loop stopped");
        });

        let recoverer = RecoveryLoop {
            db: self.db,
            config: self.config,
        };
        let mut recovery_shutdown = shutdown_rx;
        let recovery_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recoverer.config.recovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = recoverer.config.recovery_interval.as_secs(),
                timeout_secs = recoverer.config.processing_timeout.as_secs(),
                "Job recovery sweep started"
            );

            loop {
                tokio::select! {
                    _ = recovery_shutdown.changed() => {
                        if *recovery_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = recoverer.recovery_tick().await {
                            tracing::warn!(error = %e, "Job recovery tick failed");
                        }
                    }
                }
            }

            tracing::info!("Job recovery sweep stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            claim_loop,
            recovery_loop,
        }
    }
}

struct ClaimLoop {
    db: Database,
    config: SchedulerConfig,
    dispatch: mpsc::Sender<JobId>,
}

impl ClaimLoop {
    /// Claim up to a batch of pending jobs and push their ids to the worker
    /// queue.
    ///
    /// Dispatch never waits on job execution: a full queue stops this tick
    /// instead of blocking, and the undispatched rows (already `processing`)
    /// come back through the recovery sweep.
    async fn claim_tick(&self) -> Result<usize> {
        let ids = self.db.claim_pending_jobs(self.config.claim_batch_size).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        counter!("atelier_jobs_claimed_total").increment(ids.len() as u64);
        tracing::debug!(claimed = ids.len(), "Claimed pending jobs");

        let mut dispatched = 0;
        for id in ids {
            match self.dispatch.try_send(JobId(id)) {
                Ok(()) => dispatched += 1,
                Err(mpsc::error::TrySendError::Full(id)) => {
                    tracing::warn!(
                        job_id = %id,
                        "Worker queue full, leaving remaining jobs to the recovery sweep"
                    );
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("Worker queue closed, stopping dispatch");
                    break;
                }
            }
        }

        Ok(dispatched)
    }
}

struct RecoveryLoop {
    db: Database,
    config: SchedulerConfig,
}

impl RecoveryLoop {
    /// Return stalled `processing` jobs (heartbeat older than the processing
    /// timeout) to `pending`. Recovers jobs whose worker crashed before
    /// completing or before sending a heartbeat.
    async fn recovery_tick(&self) -> Result<usize> {
        let ids = self
            .db
            .recover_stalled_jobs(self.config.processing_timeout)
            .await?;

        if !ids.is_empty() {
            counter!("atelier_jobs_recovered_total").increment(ids.len() as u64);
            tracing::warn!(
                recovered = ids.len(),
                job_ids = ?ids,
                "Recovered stalled jobs back to pending"
            );
        }

        Ok(ids.len())
    }
}
