//! In-memory implementation of `ScanStore` for tests and embedded use.
//!
//! A single `RwLock` over plain maps. Every write method takes the write
//! lock for its whole critical section, which gives the same observable
//! atomicity as the Postgres transactions (claims cannot double-fire, the
//! OOB promotion decision happens once).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metrics::{
    percentile, ActivityRollup, JobDurationStats, ThroughputSnapshot,
};
use crate::oob;
use crate::queue::resolved_max_duration_ms;
use crate::store::ScanStore;
use crate::types::*;

#[derive(Default)]
struct Inner {
    workspaces: HashMap<Uuid, Workspace>,
    scans: HashMap<Uuid, Scan>,
    jobs: HashMap<Uuid, ScanJob>,
    /// Insertion order, the tie-breaker under equal (priority, created_at).
    job_seq: HashMap<Uuid, u64>,
    next_seq: u64,
    nodes: HashMap<String, WorkerNode>,
    oob_tests: HashMap<Uuid, OobTest>,
    interactions: HashMap<Uuid, OobInteraction>,
    issues: HashMap<Uuid, Issue>,
    browser_events: HashMap<Uuid, BrowserEvent>,
    histories: HashMap<Uuid, History>,
    websockets: HashMap<Uuid, WebSocketConnection>,
    api_definitions: HashMap<Uuid, ApiDefinition>,
    api_endpoints: HashMap<Uuid, ApiEndpoint>,
    api_scans: HashMap<Uuid, ApiScan>,
    site_behavior: HashMap<(Uuid, String), SiteBehaviorResult>,
    api_behavior: HashMap<Uuid, ApiBehaviorResult>,
    proxy_services: HashMap<Uuid, ProxyService>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Timestamps for inserts come from this clock; methods that take an
    /// explicit `now` use the argument.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn claim_sort_key(job: &ScanJob, seq: u64) -> (std::cmp::Reverse<i32>, DateTime<Utc>, u64) {
    (std::cmp::Reverse(job.priority), job.created_at, seq)
}

fn scan_accepts_claims(scan: &Scan, now: DateTime<Utc>) -> bool {
    scan.status.is_claimable() && !scan.throttled_until.is_some_and(|t| t > now)
}

fn requeue(job: &mut ScanJob) {
    job.status = JobStatus::Pending;
    job.worker_id = None;
    job.claimed_at = None;
    job.started_at = None;
}

#[async_trait]
impl ScanStore for MemoryStore {
    // ── Workspaces ──

    async fn create_workspace(&self, code: &str, name: &str) -> Result<Workspace> {
        let mut w = self.inner.write().await;
        let workspace = Workspace {
            id: Uuid::now_v7(),
            code: code.to_string(),
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        w.workspaces.insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        let r = self.inner.read().await;
        Ok(r.workspaces.get(&id).cloned())
    }

    // ── Scans ──

    async fn create_scan(&self, scan: &NewScan) -> Result<Scan> {
        let mut w = self.inner.write().await;
        let now = self.clock.now();
        let row = Scan {
            id: Uuid::now_v7(),
            workspace_id: scan.workspace_id,
            title: scan.title.clone(),
            options: scan.options.clone(),
            status: ScanStatus::Pending,
            phase: ScanPhase::Crawl,
            previous_status: None,
            max_rps: scan.max_rps,
            max_concurrent_jobs: scan.max_concurrent_jobs,
            consecutive_failures: 0,
            last_failure_at: None,
            throttled_until: None,
            jobs_total: 0,
            jobs_pending: 0,
            jobs_running: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            started_at: None,
            paused_at: None,
            completed_at: None,
            checkpoint: None,
            isolated: scan.isolated,
            capture_browser_events: scan.capture_browser_events,
            created_at: now,
            updated_at: now,
        };
        w.scans.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        let r = self.inner.read().await;
        Ok(r.scans.get(&id).cloned())
    }

    async fn list_scans_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<Scan>> {
        let r = self.inner.read().await;
        let mut scans: Vec<Scan> = r
            .scans
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        scans.sort_by_key(|s| s.created_at);
        Ok(scans)
    }

    async fn start_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if scan.status != ScanStatus::Pending {
            return Ok(None);
        }
        scan.status = ScanStatus::Crawling;
        scan.started_at = Some(now);
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn begin_scanning(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if scan.status != ScanStatus::Crawling {
            return Ok(None);
        }
        scan.status = ScanStatus::Scanning;
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn pause_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(scan.status, ScanStatus::Crawling | ScanStatus::Scanning) {
            return Ok(None);
        }
        scan.previous_status = Some(scan.status);
        scan.status = ScanStatus::Paused;
        scan.paused_at = Some(now);
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn resume_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if scan.status != ScanStatus::Paused {
            return Ok(None);
        }
        scan.status = scan.previous_status.take().unwrap_or(ScanStatus::Scanning);
        scan.paused_at = None;
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn cancel_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<(Scan, u64)>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if scan.status.is_terminal() {
            return Ok(None);
        }
        scan.status = ScanStatus::Cancelled;
        scan.completed_at = Some(now);
        scan.updated_at = now;
        let snapshot = scan.clone();

        let mut cancelled = 0;
        for job in w.jobs.values_mut().filter(|j| {
            j.scan_id == id && matches!(j.status, JobStatus::Pending | JobStatus::Claimed)
        }) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            cancelled += 1;
        }
        Ok(Some((snapshot, cancelled)))
    }

    async fn complete_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(scan.status, ScanStatus::Crawling | ScanStatus::Scanning) {
            return Ok(None);
        }
        scan.status = ScanStatus::Completed;
        scan.completed_at = Some(now);
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn fail_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        if scan.status.is_terminal() {
            return Ok(None);
        }
        scan.status = ScanStatus::Failed;
        scan.completed_at = Some(now);
        scan.updated_at = now;
        Ok(Some(scan.clone()))
    }

    async fn compare_and_swap_phase(
        &self,
        id: Uuid,
        expected: ScanPhase,
        new: ScanPhase,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(false);
        };
        if scan.phase != expected {
            return Ok(false);
        }
        scan.phase = new;
        scan.updated_at = self.clock.now();
        Ok(true)
    }

    async fn update_scan_counts(&self, id: Uuid) -> Result<Option<Scan>> {
        let mut w = self.inner.write().await;
        if !w.scans.contains_key(&id) {
            return Ok(None);
        }
        let mut total = 0;
        let mut pending = 0;
        let mut running = 0;
        let mut completed = 0;
        let mut failed = 0;
        for job in w.jobs.values().filter(|j| j.scan_id == id) {
            total += 1;
            match job.status {
                JobStatus::Pending => pending += 1,
                // Claimed jobs count as running for progress purposes.
                JobStatus::Claimed | JobStatus::Running => running += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Cancelled => {}
            }
        }
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        scan.jobs_total = total;
        scan.jobs_pending = pending;
        scan.jobs_running = running;
        scan.jobs_completed = completed;
        scan.jobs_failed = failed;
        Ok(Some(scan.clone()))
    }

    async fn update_scan_checkpoint(&self, id: Uuid, checkpoint: &Value) -> Result<()> {
        let mut w = self.inner.write().await;
        let scan = w
            .scans
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("scan", id))?;
        scan.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn set_scan_throttled_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let scan = w
            .scans
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("scan", id))?;
        scan.throttled_until = until;
        Ok(())
    }

    async fn bump_scan_failure(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<i32>> {
        let mut w = self.inner.write().await;
        let Some(scan) = w.scans.get_mut(&id) else {
            return Ok(None);
        };
        scan.consecutive_failures += 1;
        scan.last_failure_at = Some(now);
        Ok(Some(scan.consecutive_failures))
    }

    async fn reset_scan_failures(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(scan) = w.scans.get_mut(&id) {
            scan.consecutive_failures = 0;
        }
        Ok(())
    }

    // ── Jobs ──

    async fn insert_job(&self, job: &NewScanJob) -> Result<ScanJob> {
        let mut w = self.inner.write().await;
        let row = build_job(job, self.clock.now());
        let seq = w.next_seq;
        w.next_seq += 1;
        w.job_seq.insert(row.id, seq);
        w.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_jobs(&self, jobs: &[NewScanJob]) -> Result<Vec<Uuid>> {
        let mut w = self.inner.write().await;
        let now = self.clock.now();
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let row = build_job(job, now);
            let seq = w.next_seq;
            w.next_seq += 1;
            w.job_seq.insert(row.id, seq);
            ids.push(row.id);
            w.jobs.insert(row.id, row);
        }
        Ok(ids)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>> {
        let r = self.inner.read().await;
        Ok(r.jobs.get(&id).cloned())
    }

    async fn list_jobs_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanJob>> {
        let r = self.inner.read().await;
        let mut jobs: Vec<ScanJob> = r
            .jobs
            .values()
            .filter(|j| j.scan_id == scan_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| r.job_seq.get(&j.id).copied().unwrap_or(0));
        Ok(jobs)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ScanJob>> {
        let mut w = self.inner.write().await;

        let mut in_flight: HashMap<Uuid, i64> = HashMap::new();
        for job in w.jobs.values().filter(|j| j.status.is_in_flight()) {
            *in_flight.entry(job.scan_id).or_insert(0) += 1;
        }

        let mut best: Option<((std::cmp::Reverse<i32>, DateTime<Utc>, u64), Uuid)> = None;
        for job in w.jobs.values().filter(|j| j.status == JobStatus::Pending) {
            let Some(scan) = w.scans.get(&job.scan_id) else {
                continue;
            };
            if scan.isolated || !scan_accepts_claims(scan, now) {
                continue;
            }
            if let Some(cap) = scan.max_concurrent_jobs {
                if in_flight.get(&job.scan_id).copied().unwrap_or(0) >= cap as i64 {
                    continue;
                }
            }
            let seq = w.job_seq.get(&job.id).copied().unwrap_or(0);
            let key = claim_sort_key(job, seq);
            if best.as_ref().is_none_or(|(bk, _)| key < *bk) {
                best = Some((key, job.id));
            }
        }

        let Some((_, id)) = best else {
            return Ok(None);
        };
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Claimed;
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn claim_next_for_scan(
        &self,
        worker_id: &str,
        scan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        let mut w = self.inner.write().await;

        let Some(scan) = w.scans.get(&scan_id) else {
            return Ok(None);
        };
        if !scan_accepts_claims(scan, now) {
            return Ok(None);
        }
        if let Some(cap) = scan.max_concurrent_jobs {
            let in_flight = w
                .jobs
                .values()
                .filter(|j| j.scan_id == scan_id && j.status.is_in_flight())
                .count() as i64;
            if in_flight >= cap as i64 {
                return Ok(None);
            }
        }

        let mut best: Option<((std::cmp::Reverse<i32>, DateTime<Utc>, u64), Uuid)> = None;
        for job in w
            .jobs
            .values()
            .filter(|j| j.scan_id == scan_id && j.status == JobStatus::Pending)
        {
            let seq = w.job_seq.get(&job.id).copied().unwrap_or(0);
            let key = claim_sort_key(job, seq);
            if best.as_ref().is_none_or(|(bk, _)| key < *bk) {
                best = Some((key, job.id));
            }
        }

        let Some((_, id)) = best else {
            return Ok(None);
        };
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Claimed;
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ScanJob>> {
        let mut w = self.inner.write().await;
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Claimed {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn mark_job_completed(
        &self,
        id: Uuid,
        issues_found: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        let mut w = self.inner.write().await;
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.issues_found = issues_found;
        Ok(Some(job.clone()))
    }

    async fn mark_job_failed(
        &self,
        id: Uuid,
        error_type: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        let mut w = self.inner.write().await;
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.error_type = Some(error_type.to_string());
        job.error_message = Some(error_message.to_string());
        if job.attempts < job.max_attempts {
            requeue(job);
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
        }
        Ok(Some(job.clone()))
    }

    async fn cancel_jobs(
        &self,
        scan_id: Uuid,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut w = self.inner.write().await;
        let mut cancelled = 0;
        for job in w.jobs.values_mut().filter(|j| {
            j.scan_id == scan_id
                && matches!(j.status, JobStatus::Pending | JobStatus::Claimed)
                && filter.job_type.is_none_or(|t| j.job_type == t)
        }) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn reset_stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut w = self.inner.write().await;
        let mut reset = 0;
        for job in w.jobs.values_mut().filter(|j| {
            j.status == JobStatus::Claimed && j.claimed_at.is_some_and(|c| c < cutoff)
        }) {
            requeue(job);
            reset += 1;
        }
        Ok(reset)
    }

    async fn reset_timed_out(&self, now: DateTime<Utc>) -> Result<(u64, Vec<Uuid>)> {
        let mut w = self.inner.write().await;
        let mut failed = 0;
        let mut scan_ids = Vec::new();
        for job in w.jobs.values_mut().filter(|j| {
            j.status.is_in_flight()
                && j.deadline().is_some_and(|d| d < now)
        }) {
            job.status = JobStatus::Failed;
            job.error_type = Some("timeout".to_string());
            job.error_message = Some(format!(
                "exceeded max duration of {}ms",
                job.max_duration_ms
            ));
            job.completed_at = Some(now);
            failed += 1;
            if !scan_ids.contains(&job.scan_id) {
                scan_ids.push(job.scan_id);
            }
        }
        Ok((failed, scan_ids))
    }

    async fn release_by_worker(&self, worker_id: &str) -> Result<u64> {
        let mut w = self.inner.write().await;
        let mut released = 0;
        for job in w.jobs.values_mut().filter(|j| {
            j.status.is_in_flight() && j.worker_id.as_deref() == Some(worker_id)
        }) {
            requeue(job);
            released += 1;
        }
        Ok(released)
    }

    async fn release_by_worker_node(&self, node_id: &str) -> Result<u64> {
        let prefix = format!("{node_id}-");
        let mut w = self.inner.write().await;
        let mut released = 0;
        for job in w.jobs.values_mut().filter(|j| {
            j.status.is_in_flight()
                && j.worker_id.as_deref().is_some_and(|wid| wid.starts_with(&prefix))
        }) {
            requeue(job);
            released += 1;
        }
        Ok(released)
    }

    async fn job_stats(&self, scan_id: Uuid) -> Result<BTreeMap<JobStatus, i64>> {
        let r = self.inner.read().await;
        let mut stats = BTreeMap::new();
        for job in r.jobs.values().filter(|j| j.scan_id == scan_id) {
            *stats.entry(job.status).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn pending_job_count(&self, scan_id: Uuid) -> Result<i64> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .values()
            .filter(|j| j.scan_id == scan_id && j.status == JobStatus::Pending)
            .count() as i64)
    }

    async fn update_job_checkpoint(
        &self,
        id: Uuid,
        checkpoint: &Value,
    ) -> Result<Option<JobStatus>> {
        let mut w = self.inner.write().await;
        let Some(job) = w.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.checkpoint = Some(checkpoint.clone());
        Ok(Some(job.status))
    }

    // ── Worker nodes ──

    async fn register_node(
        &self,
        node: &NewWorkerNode,
        now: DateTime<Utc>,
    ) -> Result<WorkerNode> {
        let mut w = self.inner.write().await;
        let row = WorkerNode {
            id: node.id.clone(),
            hostname: node.hostname.clone(),
            worker_count: node.worker_count,
            status: WorkerNodeStatus::Running,
            started_at: now,
            last_seen_at: now,
            jobs_claimed: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            version: node.version.clone(),
        };
        w.nodes.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_node(&self, id: &str) -> Result<Option<WorkerNode>> {
        let r = self.inner.read().await;
        Ok(r.nodes.get(id).cloned())
    }

    async fn heartbeat_node(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut w = self.inner.write().await;
        match w.nodes.get_mut(id) {
            Some(node) => {
                node.last_seen_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bump_node_counter(
        &self,
        id: &str,
        counter: NodeCounter,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let node = w
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("worker node", id))?;
        match counter {
            NodeCounter::Claimed => node.jobs_claimed += 1,
            NodeCounter::Completed => node.jobs_completed += 1,
            NodeCounter::Failed => node.jobs_failed += 1,
        }
        node.last_seen_at = now;
        Ok(())
    }

    async fn set_node_status(&self, id: &str, status: WorkerNodeStatus) -> Result<bool> {
        let mut w = self.inner.write().await;
        match w.nodes.get_mut(id) {
            Some(node) => {
                node.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister_node(&self, id: &str) -> Result<bool> {
        let mut w = self.inner.write().await;
        Ok(w.nodes.remove(id).is_some())
    }

    async fn active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .values()
            .filter(|n| n.status == WorkerNodeStatus::Running && n.last_seen_at > cutoff)
            .cloned()
            .collect())
    }

    async fn stale_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .values()
            .filter(|n| n.status == WorkerNodeStatus::Running && n.last_seen_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn mark_stale_nodes_stopped(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut w = self.inner.write().await;
        let mut stopped = Vec::new();
        for node in w
            .nodes
            .values_mut()
            .filter(|n| n.status == WorkerNodeStatus::Running && n.last_seen_at <= cutoff)
        {
            node.status = WorkerNodeStatus::Stopped;
            stopped.push(node.id.clone());
        }
        Ok(stopped)
    }

    async fn delete_stopped_nodes(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut w = self.inner.write().await;
        let doomed: Vec<String> = w
            .nodes
            .values()
            .filter(|n| n.status == WorkerNodeStatus::Stopped && n.last_seen_at < cutoff)
            .map(|n| n.id.clone())
            .collect();
        for id in &doomed {
            w.nodes.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    // ── OOB correlation ──

    async fn insert_oob_test(&self, test: &NewOobTest) -> Result<OobTest> {
        let mut w = self.inner.write().await;
        let row = OobTest {
            id: Uuid::now_v7(),
            workspace_id: test.workspace_id,
            scan_id: test.scan_id,
            scan_job_id: test.scan_job_id,
            history_id: test.history_id,
            code: test.code.clone(),
            test_name: test.test_name.clone(),
            target: test.target.clone(),
            interaction_full_id: oob::normalize_full_id(&test.interaction_full_id),
            interaction_domain: test.interaction_domain.clone(),
            payload: if test.payload.is_empty() {
                None
            } else {
                Some(oob::encode_payload(&test.payload))
            },
            insertion_point: test.insertion_point.clone(),
            issue_id: None,
            created_at: self.clock.now(),
        };
        w.oob_tests.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_oob_test(&self, id: Uuid) -> Result<Option<OobTest>> {
        let r = self.inner.read().await;
        Ok(r.oob_tests.get(&id).cloned())
    }

    async fn correlate_oob_interaction(
        &self,
        full_id_normalized: &str,
        interaction: &NewOobInteraction,
    ) -> Result<CorrelationOutcome> {
        // The write lock serializes the promote-or-append decision, the
        // same role the `FOR UPDATE` on the test row plays in Postgres.
        let mut w = self.inner.write().await;

        let Some(test) = w
            .oob_tests
            .values()
            .find(|t| t.interaction_full_id == full_id_normalized)
            .cloned()
        else {
            return Ok(CorrelationOutcome::NoMatch);
        };
        let test_id = test.id;

        let mut row = OobInteraction {
            id: Uuid::now_v7(),
            oob_test_id: Some(test.id),
            workspace_id: Some(test.workspace_id),
            issue_id: None,
            protocol: interaction.protocol.clone(),
            full_id: interaction.full_id.clone(),
            qtype: interaction.qtype.clone(),
            raw_request: interaction.raw_request.clone(),
            raw_response: interaction.raw_response.clone(),
            remote_address: interaction.remote_address.clone(),
            timestamp: interaction.timestamp,
        };

        if let Some(issue_id) = test.issue_id {
            row.issue_id = Some(issue_id);
            w.interactions.insert(row.id, row);

            let all: Vec<OobInteraction> = w
                .interactions
                .values()
                .filter(|i| i.issue_id == Some(issue_id))
                .cloned()
                .collect();
            let details = oob::render_details(&test, &all);
            if let Some(issue) = w.issues.get_mut(&issue_id) {
                issue.details = details;
                issue.updated_at = self.clock.now();
            }
            return Ok(CorrelationOutcome::Appended { issue_id });
        }

        let template = oob::resolve_template(&test.code);
        let (request, response) = match test.history_id.and_then(|h| w.histories.get(&h)) {
            Some(history) => (history.raw_request.clone(), history.raw_response.clone()),
            None => (None, None),
        };

        let issue_id = Uuid::now_v7();
        let now = self.clock.now();
        row.issue_id = Some(issue_id);
        let details = oob::render_details(&test, std::slice::from_ref(&row));
        w.interactions.insert(row.id, row);

        w.issues.insert(
            issue_id,
            Issue {
                id: issue_id,
                workspace_id: test.workspace_id,
                scan_id: test.scan_id,
                code: test.code.clone(),
                title: template.title.to_string(),
                description: template.description.to_string(),
                details,
                severity: template.severity,
                confidence: oob::OOB_CONFIDENCE,
                url: Some(test.target.clone()),
                request,
                response,
                created_at: now,
                updated_at: now,
            },
        );
        if let Some(test) = w.oob_tests.get_mut(&test_id) {
            test.issue_id = Some(issue_id);
        }
        Ok(CorrelationOutcome::Promoted { issue_id })
    }

    async fn get_issue(&self, id: Uuid) -> Result<Option<Issue>> {
        let r = self.inner.read().await;
        Ok(r.issues.get(&id).cloned())
    }

    async fn interactions_for_issue(&self, issue_id: Uuid) -> Result<Vec<OobInteraction>> {
        let r = self.inner.read().await;
        let mut interactions: Vec<OobInteraction> = r
            .interactions
            .values()
            .filter(|i| i.issue_id == Some(issue_id))
            .cloned()
            .collect();
        interactions.sort_by_key(|i| i.timestamp);
        Ok(interactions)
    }

    // ── Browser events ──

    async fn upsert_browser_event(
        &self,
        content_hash: &str,
        event: &NewBrowserEvent,
        now: DateTime<Utc>,
    ) -> Result<BrowserEvent> {
        let mut w = self.inner.write().await;

        let existing = w.browser_events.values_mut().find(|e| {
            e.content_hash == content_hash
                && e.workspace_id == event.workspace_id
                && e.scan_id == event.scan_id
        });
        if let Some(row) = existing {
            row.occurrence_count += 1;
            row.last_seen_at = now;
            return Ok(row.clone());
        }

        let row = BrowserEvent {
            id: Uuid::now_v7(),
            workspace_id: event.workspace_id,
            scan_id: event.scan_id,
            event_type: event.event_type.clone(),
            category: event.category.clone(),
            url: event.url.clone(),
            data: event.data.clone(),
            content_hash: content_hash.to_string(),
            occurrence_count: 1,
            first_seen_at: now,
            last_seen_at: now,
        };
        w.browser_events.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_browser_event(
        &self,
        content_hash: &str,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
    ) -> Result<Option<BrowserEvent>> {
        let r = self.inner.read().await;
        Ok(r.browser_events
            .values()
            .find(|e| {
                e.content_hash == content_hash
                    && e.workspace_id == workspace_id
                    && e.scan_id == scan_id
            })
            .cloned())
    }

    // ── Histories / connections / API surface ──

    async fn insert_history(&self, history: &NewHistory) -> Result<History> {
        let mut w = self.inner.write().await;
        let row = History {
            id: Uuid::now_v7(),
            workspace_id: history.workspace_id,
            scan_id: history.scan_id,
            url: history.url.clone(),
            method: history.method.clone(),
            status_code: history.status_code,
            source: history.source,
            raw_request: history.raw_request.clone(),
            raw_response: history.raw_response.clone(),
            created_at: self.clock.now(),
        };
        w.histories.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_websocket_connection(
        &self,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
        url: &str,
    ) -> Result<WebSocketConnection> {
        let mut w = self.inner.write().await;
        let row = WebSocketConnection {
            id: Uuid::now_v7(),
            workspace_id,
            scan_id,
            url: url.to_string(),
            created_at: self.clock.now(),
        };
        w.websockets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_api_definition(
        &self,
        workspace_id: Uuid,
        name: &str,
        source_url: Option<&str>,
        schema: &Value,
    ) -> Result<ApiDefinition> {
        let mut w = self.inner.write().await;
        let row = ApiDefinition {
            id: Uuid::now_v7(),
            workspace_id,
            name: name.to_string(),
            source_url: source_url.map(str::to_string),
            schema: schema.clone(),
            created_at: self.clock.now(),
        };
        w.api_definitions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_api_endpoint(
        &self,
        api_definition_id: Uuid,
        path: &str,
        method: &str,
        parameters: &Value,
    ) -> Result<ApiEndpoint> {
        let mut w = self.inner.write().await;
        let row = ApiEndpoint {
            id: Uuid::now_v7(),
            api_definition_id,
            path: path.to_string(),
            method: method.to_string(),
            parameters: parameters.clone(),
        };
        w.api_endpoints.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_api_scan(
        &self,
        scan_id: Uuid,
        api_definition_id: Uuid,
    ) -> Result<ApiScan> {
        let mut w = self.inner.write().await;
        let row = ApiScan {
            id: Uuid::now_v7(),
            scan_id,
            api_definition_id,
            status: "pending".to_string(),
            endpoints_probed: 0,
            created_at: self.clock.now(),
        };
        w.api_scans.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_api_scan(
        &self,
        id: Uuid,
        status: &str,
        endpoints_probed: i32,
    ) -> Result<Option<ApiScan>> {
        let mut w = self.inner.write().await;
        let Some(row) = w.api_scans.get_mut(&id) else {
            return Ok(None);
        };
        row.status = status.to_string();
        row.endpoints_probed = endpoints_probed;
        Ok(Some(row.clone()))
    }

    async fn list_api_scans(&self, scan_id: Uuid) -> Result<Vec<ApiScan>> {
        let r = self.inner.read().await;
        let mut rows: Vec<ApiScan> = r
            .api_scans
            .values()
            .filter(|a| a.scan_id == scan_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn upsert_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<SiteBehaviorResult> {
        let mut w = self.inner.write().await;
        let key = (scan_id, base_url.to_string());
        if let Some(row) = w.site_behavior.get_mut(&key) {
            row.fingerprint = fingerprint.clone();
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = SiteBehaviorResult {
            id: Uuid::now_v7(),
            scan_id,
            base_url: base_url.to_string(),
            fingerprint: fingerprint.clone(),
            created_at: now,
            updated_at: now,
        };
        w.site_behavior.insert(key, row.clone());
        Ok(row)
    }

    async fn get_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
    ) -> Result<Option<SiteBehaviorResult>> {
        let r = self.inner.read().await;
        Ok(r.site_behavior.get(&(scan_id, base_url.to_string())).cloned())
    }

    async fn insert_api_behavior(
        &self,
        scan_id: Option<Uuid>,
        api_definition_id: Uuid,
        behavior_class: BehaviorClass,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<ApiBehaviorResult> {
        let mut w = self.inner.write().await;
        let row = ApiBehaviorResult {
            id: Uuid::now_v7(),
            scan_id,
            api_definition_id,
            behavior_class,
            fingerprint: fingerprint.clone(),
            created_at: now,
        };
        w.api_behavior.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_api_behavior(&self, api_definition_id: Uuid) -> Result<Vec<ApiBehaviorResult>> {
        let r = self.inner.read().await;
        let mut rows: Vec<ApiBehaviorResult> = r
            .api_behavior
            .values()
            .filter(|b| b.api_definition_id == api_definition_id)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.created_at);
        Ok(rows)
    }

    async fn create_proxy_service(
        &self,
        workspace_id: Uuid,
        name: &str,
        port: i32,
    ) -> Result<ProxyService> {
        let mut w = self.inner.write().await;
        if w.proxy_services.values().any(|p| p.port == port) {
            return Err(Error::Constraint(format!(
                "proxy service port {port} is already in use"
            )));
        }
        let row = ProxyService {
            id: Uuid::now_v7(),
            workspace_id,
            name: name.to_string(),
            port,
            created_at: self.clock.now(),
        };
        w.proxy_services.insert(row.id, row.clone());
        Ok(row)
    }

    // ── Metrics ──

    async fn throughput_snapshot(&self, now: DateTime<Utc>) -> Result<ThroughputSnapshot> {
        let r = self.inner.read().await;

        let completed_since = |cutoff: DateTime<Utc>| {
            r.jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Completed
                        && j.completed_at.is_some_and(|c| c > cutoff)
                })
                .count() as i64
        };

        let hour_ago = now - Duration::hours(1);
        let completed_last_hour = completed_since(hour_ago);
        let completed_last_5m = completed_since(now - Duration::minutes(5));
        let failed_last_hour = r
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed && j.completed_at.is_some_and(|c| c > hour_ago)
            })
            .count() as i64;

        let denom = completed_last_hour + failed_last_hour;
        Ok(ThroughputSnapshot {
            completed_last_minute: completed_since(now - Duration::minutes(1)),
            completed_last_5m,
            completed_last_hour,
            jobs_per_minute: completed_last_5m as f64 / 5.0,
            success_rate: (denom > 0).then(|| completed_last_hour as f64 / denom as f64),
            pending: r
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending)
                .count() as i64,
            in_flight: r
                .jobs
                .values()
                .filter(|j| j.status.is_in_flight())
                .count() as i64,
        })
    }

    async fn duration_stats(&self, now: DateTime<Utc>) -> Result<Vec<JobDurationStats>> {
        let r = self.inner.read().await;
        let hour_ago = now - Duration::hours(1);

        let mut by_type: BTreeMap<JobType, Vec<i64>> = BTreeMap::new();
        for job in r.jobs.values().filter(|j| {
            j.status == JobStatus::Completed && j.completed_at.is_some_and(|c| c > hour_ago)
        }) {
            if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
                by_type
                    .entry(job.job_type)
                    .or_default()
                    .push((completed - started).num_milliseconds());
            }
        }

        Ok(by_type
            .into_iter()
            .map(|(job_type, mut durations)| {
                durations.sort_unstable();
                let count = durations.len() as i64;
                let sum: i64 = durations.iter().sum();
                JobDurationStats {
                    job_type,
                    count,
                    min_ms: durations[0],
                    max_ms: durations[durations.len() - 1],
                    avg_ms: sum as f64 / count as f64,
                    p50_ms: percentile(&durations, 0.50),
                    p95_ms: percentile(&durations, 0.95),
                    p99_ms: percentile(&durations, 0.99),
                }
            })
            .collect())
    }

    async fn scan_rollup(&self, scan_id: Uuid) -> Result<ActivityRollup> {
        let r = self.inner.read().await;
        Ok(rollup(
            r.issues.values().filter(|i| i.scan_id == Some(scan_id)),
            r.histories.values().filter(|h| h.scan_id == Some(scan_id)),
        ))
    }

    async fn workspace_rollup(&self, workspace_id: Uuid) -> Result<ActivityRollup> {
        let r = self.inner.read().await;
        Ok(rollup(
            r.issues.values().filter(|i| i.workspace_id == workspace_id),
            r.histories.values().filter(|h| h.workspace_id == workspace_id),
        ))
    }
}

fn build_job(job: &NewScanJob, now: DateTime<Utc>) -> ScanJob {
    ScanJob {
        id: Uuid::now_v7(),
        scan_id: job.scan_id,
        status: JobStatus::Pending,
        job_type: job.job_type,
        priority: job.priority,
        worker_id: None,
        claimed_at: None,
        started_at: None,
        completed_at: None,
        attempts: 0,
        max_attempts: job.max_attempts,
        max_duration_ms: resolved_max_duration_ms(job),
        target_host: job.target_host.clone(),
        url: job.url.clone(),
        method: job.method.clone(),
        history_id: job.history_id,
        websocket_connection_id: job.websocket_connection_id,
        api_definition_id: job.api_definition_id,
        payload: job.payload.clone(),
        error_type: None,
        error_message: None,
        issues_found: 0,
        checkpoint: None,
        created_at: now,
    }
}

fn rollup<'a>(
    issues: impl Iterator<Item = &'a Issue>,
    histories: impl Iterator<Item = &'a History>,
) -> ActivityRollup {
    let mut out = ActivityRollup::default();
    for issue in issues {
        match issue.severity {
            Severity::Unknown => out.issues.unknown += 1,
            Severity::Info => out.issues.info += 1,
            Severity::Low => out.issues.low += 1,
            Severity::Medium => out.issues.medium += 1,
            Severity::High => out.issues.high += 1,
            Severity::Critical => out.issues.critical += 1,
        }
    }
    for history in histories {
        match history.source {
            HistorySource::Crawler => out.requests.crawler += 1,
            HistorySource::Scanner => out.requests.scanner += 1,
        }
    }
    out
}
