//! Persistence trait for all orchestration state.
//!
//! Async methods organized by concern. Components operate exclusively
//! through this trait, enabling pluggable backends (`MemoryStore` for tests
//! and embedded use, Postgres for production). Every method either commits
//! fully or returns an error; partial writes are not observable.
//!
//! Multi-step operations that must be atomic (the claim, the OOB
//! promotion, the browser-event upsert, the timeout sweep) are single
//! methods here so each backend owns its transaction and locking. Store
//! methods that compare against "now" take the instant as an argument; the
//! caller reads it from a `Clock`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{ActivityRollup, JobDurationStats, ThroughputSnapshot};
use crate::types::*;

#[async_trait]
pub trait ScanStore: Send + Sync {
    // ── Workspaces ──

    async fn create_workspace(&self, code: &str, name: &str) -> Result<Workspace>;
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>>;

    // ── Scans ──

    async fn create_scan(&self, scan: &NewScan) -> Result<Scan>;
    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>>;
    async fn list_scans_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<Scan>>;

    /// pending → crawling; sets `started_at`. `None` when the precondition
    /// does not hold (conditional update, safe under races).
    async fn start_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// crawling → scanning.
    async fn begin_scanning(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// {crawling, scanning} → paused; stashes the current status in
    /// `previous_status` and sets `paused_at`.
    async fn pause_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// paused → `previous_status` (falling back to scanning); clears
    /// `paused_at` and `previous_status`.
    async fn resume_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// Any non-terminal status → cancelled; sets `completed_at` and, in the
    /// same transaction, bulk-cancels the scan's pending/claimed jobs.
    /// Returns the scan and the number of jobs cancelled.
    async fn cancel_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<(Scan, u64)>>;

    /// {crawling, scanning} → completed; sets `completed_at`.
    async fn complete_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// Any non-terminal status → failed; sets `completed_at`.
    async fn fail_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>>;

    /// Compare-and-swap on the phase column. Returns true iff this call won
    /// the transition. The only permitted phase-advance mechanism.
    async fn compare_and_swap_phase(
        &self,
        id: Uuid,
        expected: ScanPhase,
        new: ScanPhase,
    ) -> Result<bool>;

    /// Recompute the job counters from the scan_jobs rows in one statement.
    async fn update_scan_counts(&self, id: Uuid) -> Result<Option<Scan>>;

    async fn update_scan_checkpoint(&self, id: Uuid, checkpoint: &Value) -> Result<()>;

    async fn set_scan_throttled_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Increment `consecutive_failures` and stamp `last_failure_at`.
    /// Returns the new streak, or `None` for an unknown scan.
    async fn bump_scan_failure(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<i32>>;

    /// Reset the failure streak after a success.
    async fn reset_scan_failures(&self, id: Uuid) -> Result<()>;

    // ── Jobs ──

    async fn insert_job(&self, job: &NewScanJob) -> Result<ScanJob>;
    async fn insert_jobs(&self, jobs: &[NewScanJob]) -> Result<Vec<Uuid>>;
    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>>;
    async fn list_jobs_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanJob>>;

    /// Atomically claim one pending job whose scan is claimable (crawling or
    /// scanning), not isolated, not throttled past `now`, and under its
    /// `max_concurrent_jobs` cap (live subquery, NULL = unbounded). Ordering
    /// `priority DESC, created_at ASC`. Sets status=claimed, `worker_id`,
    /// `claimed_at`. Never blocks; `None` when nothing is eligible.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ScanJob>>;

    /// Same as `claim_next` but constrained to one scan, and the only path
    /// that serves isolated scans.
    async fn claim_next_for_scan(
        &self,
        worker_id: &str,
        scan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>>;

    /// claimed → running; sets `started_at`, increments `attempts`. `None`
    /// when the job is no longer claimed (cancelled or re-armed between
    /// the claim and this call), so a raced worker cannot resurrect it.
    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ScanJob>>;

    async fn mark_job_completed(
        &self,
        id: Uuid,
        issues_found: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>>;

    /// Records the error. While `attempts < max_attempts` the job is
    /// re-armed to pending with claim fields cleared; otherwise it becomes
    /// terminal failed with `completed_at` set.
    async fn mark_job_failed(
        &self,
        id: Uuid,
        error_type: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>>;

    /// Bulk-transition pending/claimed jobs of a scan to cancelled.
    async fn cancel_jobs(
        &self,
        scan_id: Uuid,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Re-arm orphaned claimed jobs with `claimed_at` older than `cutoff`
    /// back to pending, clearing the claim fields. Returns the count.
    async fn reset_stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Mark claimed/running jobs past `started_at + max_duration` as failed
    /// with `error_type = "timeout"`. Timeouts are terminal, no retry.
    /// Returns the count and the distinct scans affected.
    async fn reset_timed_out(&self, now: DateTime<Utc>) -> Result<(u64, Vec<Uuid>)>;

    /// Graceful shutdown: in-flight jobs of this worker back to pending.
    async fn release_by_worker(&self, worker_id: &str) -> Result<u64>;

    /// Same, for every worker slot of a node (`worker_id LIKE node || '-%'`).
    async fn release_by_worker_node(&self, node_id: &str) -> Result<u64>;

    async fn job_stats(&self, scan_id: Uuid) -> Result<BTreeMap<JobStatus, i64>>;
    async fn pending_job_count(&self, scan_id: Uuid) -> Result<i64>;

    /// Write the job checkpoint, returning the job's current status so a
    /// running worker observes cancellation at its next checkpoint write.
    async fn update_job_checkpoint(
        &self,
        id: Uuid,
        checkpoint: &Value,
    ) -> Result<Option<JobStatus>>;

    // ── Worker nodes ──

    /// Upsert by id: status running, fresh timestamps, counters reset.
    async fn register_node(
        &self,
        node: &NewWorkerNode,
        now: DateTime<Utc>,
    ) -> Result<WorkerNode>;

    async fn get_node(&self, id: &str) -> Result<Option<WorkerNode>>;
    async fn heartbeat_node(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Atomic counter bump that also refreshes `last_seen_at`.
    async fn bump_node_counter(
        &self,
        id: &str,
        counter: NodeCounter,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_node_status(&self, id: &str, status: WorkerNodeStatus) -> Result<bool>;
    async fn deregister_node(&self, id: &str) -> Result<bool>;

    /// Running nodes seen since `cutoff`.
    async fn active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>>;

    /// Running nodes NOT seen since `cutoff`.
    async fn stale_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>>;

    /// Mark stale nodes stopped; returns their ids.
    async fn mark_stale_nodes_stopped(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Delete stopped nodes last seen before `cutoff`. Returns the count.
    async fn delete_stopped_nodes(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ── OOB correlation ──

    async fn insert_oob_test(&self, test: &NewOobTest) -> Result<OobTest>;
    async fn get_oob_test(&self, id: Uuid) -> Result<Option<OobTest>>;

    /// Transactionally match an inbound interaction to the test carrying
    /// `full_id_normalized`, locking the test row so the promote-to-issue
    /// decision happens exactly once across concurrent arrivals. See
    /// `oob::OobCorrelator` for the algorithm the backends implement.
    async fn correlate_oob_interaction(
        &self,
        full_id_normalized: &str,
        interaction: &NewOobInteraction,
    ) -> Result<CorrelationOutcome>;

    async fn get_issue(&self, id: Uuid) -> Result<Option<Issue>>;

    /// Interactions attached to an issue, `timestamp ASC`.
    async fn interactions_for_issue(&self, issue_id: Uuid) -> Result<Vec<OobInteraction>>;

    // ── Browser events ──

    /// Dedup upsert scoped to (workspace, scan or NULL scan): an existing
    /// row gets `occurrence_count += 1` and `last_seen_at = now`; otherwise
    /// insert with count 1 and both timestamps at `now`.
    async fn upsert_browser_event(
        &self,
        content_hash: &str,
        event: &NewBrowserEvent,
        now: DateTime<Utc>,
    ) -> Result<BrowserEvent>;

    async fn find_browser_event(
        &self,
        content_hash: &str,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
    ) -> Result<Option<BrowserEvent>>;

    // ── Histories / connections / API surface ──

    async fn insert_history(&self, history: &NewHistory) -> Result<History>;

    async fn insert_websocket_connection(
        &self,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
        url: &str,
    ) -> Result<WebSocketConnection>;

    async fn insert_api_definition(
        &self,
        workspace_id: Uuid,
        name: &str,
        source_url: Option<&str>,
        schema: &Value,
    ) -> Result<ApiDefinition>;

    async fn insert_api_endpoint(
        &self,
        api_definition_id: Uuid,
        path: &str,
        method: &str,
        parameters: &Value,
    ) -> Result<ApiEndpoint>;

    async fn create_api_scan(
        &self,
        scan_id: Uuid,
        api_definition_id: Uuid,
    ) -> Result<ApiScan>;

    async fn update_api_scan(
        &self,
        id: Uuid,
        status: &str,
        endpoints_probed: i32,
    ) -> Result<Option<ApiScan>>;

    async fn list_api_scans(&self, scan_id: Uuid) -> Result<Vec<ApiScan>>;

    /// Upsert keyed on the `(scan_id, base_url)` unique constraint; the
    /// fingerprint is overwritten on re-observation.
    async fn upsert_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<SiteBehaviorResult>;

    async fn get_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
    ) -> Result<Option<SiteBehaviorResult>>;

    async fn insert_api_behavior(
        &self,
        scan_id: Option<Uuid>,
        api_definition_id: Uuid,
        behavior_class: BehaviorClass,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<ApiBehaviorResult>;

    async fn list_api_behavior(&self, api_definition_id: Uuid) -> Result<Vec<ApiBehaviorResult>>;

    /// Unique `port` violations surface to the caller; no silent fixup.
    async fn create_proxy_service(
        &self,
        workspace_id: Uuid,
        name: &str,
        port: i32,
    ) -> Result<ProxyService>;

    // ── Metrics ──

    async fn throughput_snapshot(&self, now: DateTime<Utc>) -> Result<ThroughputSnapshot>;
    async fn duration_stats(&self, now: DateTime<Utc>) -> Result<Vec<JobDurationStats>>;
    async fn scan_rollup(&self, scan_id: Uuid) -> Result<ActivityRollup>;
    async fn workspace_rollup(&self, workspace_id: Uuid) -> Result<ActivityRollup>;
}
