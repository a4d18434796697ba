//! Scan lifecycle state machine.
//!
//! Status transitions are conditional updates in the store; a `None` from
//! the store means the precondition did not hold and becomes a typed error
//! naming the current and required statuses. Phase advance is a
//! compare-and-swap so that, with several orchestrators racing, exactly one
//! observes the win and schedules the follow-up work.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::ScanCheckpoint;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::ScanStore;
use crate::types::{JobType, NewScan, NewScanJob, Scan, ScanPhase, ScanStatus};

/// Job type that executes a phase, if the phase is job-driven.
/// Fingerprinting runs inline over history rows and schedules nothing.
pub fn job_type_for_phase(phase: ScanPhase) -> Option<JobType> {
    match phase {
        ScanPhase::Crawl => Some(JobType::Crawl),
        ScanPhase::Fingerprint => None,
        ScanPhase::SiteBehavior => Some(JobType::SiteBehavior),
        ScanPhase::ApiBehavior => Some(JobType::ApiBehavior),
        ScanPhase::Discovery => Some(JobType::Discovery),
        ScanPhase::Nuclei => Some(JobType::Nuclei),
        ScanPhase::ActiveScan => Some(JobType::ActiveScan),
        ScanPhase::Websocket => Some(JobType::WebsocketScan),
    }
}

/// What restart recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scans_examined: usize,
    pub stale_jobs_reset: u64,
    pub jobs_enqueued: usize,
}

pub struct ScanLifecycle {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl ScanLifecycle {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create(&self, scan: &NewScan) -> Result<Scan> {
        self.store.create_scan(scan).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Scan>> {
        self.store.get_scan(id).await
    }

    /// pending → crawling.
    pub async fn start(&self, id: Uuid) -> Result<Scan> {
        match self.store.start_scan(id, self.clock.now()).await? {
            Some(scan) => {
                info!(scan_id = %id, "scan started");
                Ok(scan)
            }
            None => Err(self.transition_error(id, "pending").await),
        }
    }

    /// crawling → scanning; the crawl phase has finished.
    pub async fn begin_scanning(&self, id: Uuid) -> Result<Scan> {
        match self.store.begin_scanning(id, self.clock.now()).await? {
            Some(scan) => Ok(scan),
            None => Err(self.transition_error(id, "crawling").await),
        }
    }

    /// {crawling, scanning} → paused. Claims stop selecting this scan's
    /// jobs immediately; running jobs keep running.
    pub async fn pause(&self, id: Uuid) -> Result<Scan> {
        match self.store.pause_scan(id, self.clock.now()).await? {
            Some(scan) => {
                info!(scan_id = %id, previous = ?scan.previous_status, "scan paused");
                Ok(scan)
            }
            None => Err(self.transition_error(id, "crawling, scanning").await),
        }
    }

    /// paused → previous status (scanning when none was recorded).
    pub async fn resume(&self, id: Uuid) -> Result<Scan> {
        match self.store.resume_scan(id, self.clock.now()).await? {
            Some(scan) => {
                info!(scan_id = %id, status = %scan.status, "scan resumed");
                Ok(scan)
            }
            None => Err(self.transition_error(id, "paused").await),
        }
    }

    /// Any non-terminal → cancelled; pending/claimed jobs are cancelled in
    /// the same transaction.
    pub async fn cancel(&self, id: Uuid) -> Result<Scan> {
        match self.store.cancel_scan(id, self.clock.now()).await? {
            Some((scan, cancelled_jobs)) => {
                info!(scan_id = %id, cancelled_jobs, "scan cancelled");
                self.store.update_scan_counts(id).await?;
                Ok(scan)
            }
            None => {
                Err(self
                    .transition_error(id, "pending, crawling, scanning, paused")
                    .await)
            }
        }
    }

    pub async fn complete(&self, id: Uuid) -> Result<Scan> {
        match self.store.complete_scan(id, self.clock.now()).await? {
            Some(scan) => {
                info!(scan_id = %id, "scan completed");
                Ok(scan)
            }
            None => Err(self.transition_error(id, "crawling, scanning").await),
        }
    }

    pub async fn fail(&self, id: Uuid) -> Result<Scan> {
        match self.store.fail_scan(id, self.clock.now()).await? {
            Some(scan) => {
                warn!(scan_id = %id, "scan failed");
                Ok(scan)
            }
            None => {
                Err(self
                    .transition_error(id, "pending, crawling, scanning, paused")
                    .await)
            }
        }
    }

    /// Compare-and-swap the phase. With N orchestrators attempting the same
    /// transition, exactly one gets `true`.
    pub async fn atomic_set_phase(
        &self,
        id: Uuid,
        expected: ScanPhase,
        new: ScanPhase,
    ) -> Result<bool> {
        let won = self.store.compare_and_swap_phase(id, expected, new).await?;
        if won {
            info!(scan_id = %id, from = %expected, to = %new, "phase advanced");
        }
        Ok(won)
    }

    /// Recompute the advisory job counters from the job rows.
    pub async fn update_counts(&self, id: Uuid) -> Result<Scan> {
        self.store
            .update_scan_counts(id)
            .await?
            .ok_or_else(|| Error::not_found("scan", id))
    }

    pub async fn update_checkpoint(&self, id: Uuid, checkpoint: &ScanCheckpoint) -> Result<()> {
        let blob = checkpoint.to_json()?;
        self.store.update_scan_checkpoint(id, &blob).await
    }

    /// Restart recovery, run at process start: re-arm stale claims, then
    /// for each interrupted scan reload the checkpoint and, when nothing
    /// is pending or in flight, enqueue the next expected job for the
    /// checkpointed phase. Paused scans are examined but left alone.
    pub async fn recover(&self, stale_claim_threshold: chrono::Duration) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let cutoff = self.clock.now() - stale_claim_threshold;
        report.stale_jobs_reset = self.store.reset_stale_claimed(cutoff).await?;

        let scans = self
            .store
            .list_scans_by_status(&[
                ScanStatus::Crawling,
                ScanStatus::Scanning,
                ScanStatus::Paused,
            ])
            .await?;
        report.scans_examined = scans.len();

        for scan in scans {
            if scan.status == ScanStatus::Paused {
                continue;
            }

            let checkpoint = match &scan.checkpoint {
                Some(blob) => ScanCheckpoint::from_json(blob)?,
                None => ScanCheckpoint::default(),
            };

            let stats = self.store.job_stats(scan.id).await?;
            let open: i64 = stats
                .iter()
                .filter(|(s, _)| !s.is_terminal())
                .map(|(_, n)| *n)
                .sum();
            if open > 0 {
                // Workers will pick the remaining jobs up; nothing to seed.
                continue;
            }

            let phase = checkpoint.next_phase();
            let Some(job_type) = job_type_for_phase(phase) else {
                info!(scan_id = %scan.id, phase = %phase,
                    "recovery reached an inline phase, leaving to the orchestrator");
                continue;
            };

            self.store
                .insert_job(&NewScanJob::new(scan.id, job_type))
                .await?;
            self.store.update_scan_counts(scan.id).await?;
            report.jobs_enqueued += 1;
            info!(scan_id = %scan.id, phase = %phase, job_type = %job_type,
                "recovery enqueued next phase job");
        }

        Ok(report)
    }

    /// Build the typed precondition error for a refused transition.
    async fn transition_error(&self, id: Uuid, required: &str) -> Error {
        match self.store.get_scan(id).await {
            Ok(Some(scan)) => Error::InvalidScanStatus {
                scan_id: id,
                current: scan.status,
                required: required.to_string(),
            },
            Ok(None) => Error::not_found("scan", id),
            Err(e) => e,
        }
    }
}
