//! Worker pull loop.
//!
//! Each worker loops `{claim_next → mark_running → execute →
//! mark_completed/mark_failed}` against the store; there is no dispatcher
//! state to coordinate. The audit modules themselves live outside this
//! crate and plug in through `JobHandler`. Cancellation is cooperative: a
//! handler writes checkpoints at safe points and aborts when the write
//! reports the job was cancelled. Deadlines are enforced centrally by the
//! sweeper, not here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::JobCheckpoint;
use crate::clock::Clock;
use crate::error::Result;
use crate::queue::JobQueue;
use crate::registry::WorkerRegistry;
use crate::store::ScanStore;
use crate::throttle::CircuitBreaker;
use crate::types::{JobStatus, JobType, ScanJob, ScanStatus};

/// Polling interval when the queue is empty.
const POLL_INTERVAL_MS: u64 = 500;

/// Backoff after a storage error.
const ERROR_BACKOFF_MS: u64 = 1000;

/// Terminal disposition a handler reports for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { issues_found: i32 },
    Failed { error_type: String, error_message: String },
    /// The job was cancelled mid-flight; the worker records nothing.
    Aborted,
}

/// Whether a handler should keep going after a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAck {
    Continue,
    /// The job (or its scan) was cancelled; stop at this safe point.
    Abort,
}

/// Execution context handed to a handler.
pub struct JobContext {
    pub job: ScanJob,
    store: Arc<dyn ScanStore>,
    queue: Arc<JobQueue>,
}

impl JobContext {
    /// Resume position recorded by a previous attempt, if any.
    pub fn checkpoint(&self) -> Result<JobCheckpoint> {
        match &self.job.checkpoint {
            Some(blob) => JobCheckpoint::from_json(blob),
            None => Ok(JobCheckpoint::default()),
        }
    }

    /// Persist progress at a safe point. The returned ack is the
    /// cancellation signal: it fires when the job row was cancelled or
    /// when the owning scan reached a terminal status.
    pub async fn write_checkpoint(&self, checkpoint: &JobCheckpoint) -> Result<CheckpointAck> {
        let status = self.queue.update_checkpoint(self.job.id, checkpoint).await?;
        if status == JobStatus::Cancelled {
            return Ok(CheckpointAck::Abort);
        }
        let scan_status = self.store.get_scan(self.job.scan_id).await?.map(|s| s.status);
        Ok(match scan_status {
            Some(status) if status.is_terminal() => CheckpointAck::Abort,
            _ => CheckpointAck::Continue,
        })
    }

    /// Out-of-band scan-status poll for long-running handlers that want to
    /// notice pause/cancel between checkpoints.
    pub async fn scan_status(&self) -> Result<Option<ScanStatus>> {
        Ok(self.store.get_scan(self.job.scan_id).await?.map(|s| s.status))
    }
}

/// Seam to the out-of-scope audit modules.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome>;
}

pub struct Worker {
    worker_id: String,
    node_id: String,
    /// When set, only this scan's jobs are claimed (isolated-scan mode).
    scan_filter: Option<Uuid>,
    store: Arc<dyn ScanStore>,
    queue: Arc<JobQueue>,
    registry: WorkerRegistry,
    breaker: CircuitBreaker,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ScanStore>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        worker_id: impl Into<String>,
        handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            node_id: node_id.into(),
            scan_filter: None,
            store: store.clone(),
            queue: Arc::new(JobQueue::new(store.clone(), clock.clone())),
            registry: WorkerRegistry::new(store.clone(), clock.clone()),
            breaker: CircuitBreaker::new(store, clock),
            handlers,
        }
    }

    /// Restrict this worker to one scan. Required to serve isolated scans.
    pub fn for_scan(mut self, scan_id: Uuid) -> Self {
        self.scan_filter = Some(scan_id);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the shutdown signal flips. In-flight work is finished and
    /// recorded before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_one().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "worker iteration failed");
                    tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker shutting down");
    }

    /// Claim and execute one job. Ok(false) means the queue had nothing.
    pub async fn process_one(&self) -> Result<bool> {
        let claimed = match self.scan_filter {
            Some(scan_id) => self.queue.claim_next_for_scan(&self.worker_id, scan_id).await?,
            None => self.queue.claim_next(&self.worker_id).await?,
        };
        let Some(job) = claimed else {
            return Ok(false);
        };

        self.registry.increment_claimed(&self.node_id).await;
        debug!(worker_id = %self.worker_id, job_id = %job.id, job_type = %job.job_type,
            "claimed job");

        let Some(job) = self.queue.mark_running(job.id).await? else {
            // Cancelled or re-armed between the claim and here; drop it.
            debug!(job_id = %job.id, "job no longer claimed, skipping");
            return Ok(true);
        };

        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            // Handler wiring bug. mark_running already counted the attempt,
            // so the retry cap still bounds the churn.
            self.queue
                .mark_failed(job.id, "unsupported_job_type", job.job_type.as_str())
                .await?;
            self.registry.increment_failed(&self.node_id).await;
            return Ok(true);
        };

        let scan_id = job.scan_id;
        let ctx = JobContext {
            job,
            store: self.store.clone(),
            queue: self.queue.clone(),
        };

        match handler.execute(&ctx).await {
            Ok(JobOutcome::Completed { issues_found }) => {
                self.queue.mark_completed(ctx.job.id, issues_found).await?;
                self.registry.increment_completed(&self.node_id).await;
                if let Err(e) = self.breaker.record_success(scan_id).await {
                    warn!(scan_id = %scan_id, error = %e, "failed to clear failure streak");
                }
            }
            Ok(JobOutcome::Failed { error_type, error_message }) => {
                self.queue
                    .mark_failed(ctx.job.id, &error_type, &error_message)
                    .await?;
                self.registry.increment_failed(&self.node_id).await;
                if let Err(e) = self.breaker.record_failure(scan_id).await {
                    warn!(scan_id = %scan_id, error = %e, "failed to record failure");
                }
            }
            Ok(JobOutcome::Aborted) => {
                debug!(job_id = %ctx.job.id, "job aborted after cancellation");
            }
            Err(e) => {
                self.queue
                    .mark_failed(ctx.job.id, "handler_error", &e.to_string())
                    .await?;
                self.registry.increment_failed(&self.node_id).await;
                if let Err(e) = self.breaker.record_failure(scan_id).await {
                    warn!(scan_id = %scan_id, error = %e, "failed to record failure");
                }
            }
        }

        Ok(true)
    }
}
