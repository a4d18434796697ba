//! Durable job queue.
//!
//! Thin component over the store's atomic claim primitives. Workers pull:
//! `{claim_next → mark_running → ... → mark_completed/mark_failed}` with
//! all coordination in the store, so any number of queue instances may run
//! concurrently across processes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checkpoint::JobCheckpoint;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::ScanStore;
use crate::types::{JobFilter, JobStatus, NewScanJob, ScanJob};

/// Deadline applied at enqueue when the caller left `max_duration_ms`
/// unset, keyed by job type.
pub(crate) fn resolved_max_duration_ms(job: &NewScanJob) -> i64 {
    job.max_duration_ms
        .unwrap_or_else(|| job.job_type.default_max_duration().num_milliseconds())
}

pub struct JobQueue {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn enqueue(&self, job: NewScanJob) -> Result<ScanJob> {
        let job = self.store.insert_job(&job).await?;
        debug!(job_id = %job.id, scan_id = %job.scan_id, job_type = %job.job_type, "job enqueued");
        Ok(job)
    }

    pub async fn enqueue_batch(&self, jobs: Vec<NewScanJob>) -> Result<Vec<Uuid>> {
        let ids = self.store.insert_jobs(&jobs).await?;
        debug!(count = ids.len(), "job batch enqueued");
        Ok(ids)
    }

    /// Claim one eligible pending job, or `None`. Never blocks.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ScanJob>> {
        self.store.claim_next(worker_id, self.clock.now()).await
    }

    /// Claim constrained to one scan; the only path that serves isolated
    /// scans.
    pub async fn claim_next_for_scan(
        &self,
        worker_id: &str,
        scan_id: Uuid,
    ) -> Result<Option<ScanJob>> {
        self.store
            .claim_next_for_scan(worker_id, scan_id, self.clock.now())
            .await
    }

    /// Transition a claimed job to running. `None` means the job was
    /// cancelled or re-armed since the claim; the caller must drop it.
    pub async fn mark_running(&self, id: Uuid) -> Result<Option<ScanJob>> {
        self.store.mark_job_running(id, self.clock.now()).await
    }

    pub async fn mark_completed(&self, id: Uuid, issues_found: i32) -> Result<ScanJob> {
        self.store
            .mark_job_completed(id, issues_found, self.clock.now())
            .await?
            .ok_or_else(|| Error::not_found("scan job", id))
    }

    /// Record the failure. The job is re-armed to pending while
    /// `attempts < max_attempts`, terminal failed otherwise.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error_type: &str,
        error_message: &str,
    ) -> Result<ScanJob> {
        let job = self
            .store
            .mark_job_failed(id, error_type, error_message, self.clock.now())
            .await?
            .ok_or_else(|| Error::not_found("scan job", id))?;
        debug!(job_id = %id, status = %job.status, attempts = job.attempts, error_type,
            "job failed");
        Ok(job)
    }

    /// Bulk-cancel pending/claimed jobs of a scan.
    pub async fn cancel(&self, scan_id: Uuid, filter: &JobFilter) -> Result<u64> {
        let cancelled = self.store.cancel_jobs(scan_id, filter, self.clock.now()).await?;
        if cancelled > 0 {
            info!(scan_id = %scan_id, cancelled, "cancelled queued jobs");
        }
        Ok(cancelled)
    }

    /// Re-arm claimed jobs whose claim is older than `threshold`.
    pub async fn reset_stale_claimed(&self, threshold: Duration) -> Result<u64> {
        let cutoff = self.clock.now() - threshold;
        let reset = self.store.reset_stale_claimed(cutoff).await?;
        if reset > 0 {
            info!(reset, "re-armed stale claimed jobs");
        }
        Ok(reset)
    }

    /// Fail claimed/running jobs past their deadline. Terminal: timed-out
    /// jobs are not retried. Returns the count and the scans affected.
    pub async fn reset_timed_out(&self) -> Result<(u64, Vec<Uuid>)> {
        let (failed, scan_ids) = self.store.reset_timed_out(self.clock.now()).await?;
        if failed > 0 {
            info!(failed, scans = scan_ids.len(), "timed out in-flight jobs");
        }
        Ok((failed, scan_ids))
    }

    /// Graceful shutdown: hand this worker's in-flight jobs back.
    pub async fn release_by_worker(&self, worker_id: &str) -> Result<u64> {
        let released = self.store.release_by_worker(worker_id).await?;
        if released > 0 {
            info!(worker_id, released, "released in-flight jobs");
        }
        Ok(released)
    }

    /// Release every worker slot of a node (`worker_id LIKE node || '-%'`).
    pub async fn release_by_worker_node(&self, node_id: &str) -> Result<u64> {
        let released = self.store.release_by_worker_node(node_id).await?;
        if released > 0 {
            info!(node_id, released, "released node's in-flight jobs");
        }
        Ok(released)
    }

    pub async fn stats(&self, scan_id: Uuid) -> Result<BTreeMap<JobStatus, i64>> {
        self.store.job_stats(scan_id).await
    }

    pub async fn pending_count(&self, scan_id: Uuid) -> Result<i64> {
        self.store.pending_job_count(scan_id).await
    }

    pub async fn has_pending(&self, scan_id: Uuid) -> Result<bool> {
        Ok(self.store.pending_job_count(scan_id).await? > 0)
    }

    /// Write a job checkpoint. The returned status is the cancellation
    /// signal: a worker seeing `Cancelled` aborts at this safe point.
    pub async fn update_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &JobCheckpoint,
    ) -> Result<JobStatus> {
        let blob = checkpoint.to_json()?;
        self.store
            .update_job_checkpoint(job_id, &blob)
            .await?
            .ok_or_else(|| Error::not_found("scan job", job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobType;

    #[test]
    fn max_duration_defaults_by_type() {
        let job = NewScanJob::new(Uuid::now_v7(), JobType::Crawl);
        assert_eq!(resolved_max_duration_ms(&job), 3_600_000);

        let job = NewScanJob::new(Uuid::now_v7(), JobType::Discovery);
        assert_eq!(resolved_max_duration_ms(&job), 300_000);

        let mut job = NewScanJob::new(Uuid::now_v7(), JobType::Nuclei);
        job.max_duration_ms = Some(1_000);
        assert_eq!(resolved_max_duration_ms(&job), 1_000);
    }
}
