//! Cross-component orchestration scenarios against the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use scanforge_core::checkpoint::JobCheckpoint;
use scanforge_core::clock::{Clock, ManualClock};
use scanforge_core::error::Error;
use scanforge_core::events::EventAggregator;
use scanforge_core::lifecycle::ScanLifecycle;
use scanforge_core::queue::JobQueue;
use scanforge_core::registry::{self, WorkerRegistry};
use scanforge_core::throttle::{CircuitBreaker, RateLimiter, TRIP_THRESHOLD};
use scanforge_core::types::*;
use scanforge_core::worker::{JobContext, JobHandler, JobOutcome, Worker};
use scanforge_core::{MemoryStore, ScanStore};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    queue: JobQueue,
    lifecycle: ScanLifecycle,
    registry: WorkerRegistry,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(MemoryStore::with_clock(clock_dyn.clone()));
        let store_dyn: Arc<dyn ScanStore> = store.clone();
        Self {
            store,
            clock,
            queue: JobQueue::new(store_dyn.clone(), clock_dyn.clone()),
            lifecycle: ScanLifecycle::new(store_dyn.clone(), clock_dyn.clone()),
            registry: WorkerRegistry::new(store_dyn, clock_dyn),
        }
    }

    async fn scanning_scan(&self) -> Scan {
        let ws = self
            .store
            .create_workspace("acme", "Acme Corp")
            .await
            .unwrap();
        let scan = self
            .lifecycle
            .create(&NewScan::new(ws.id, "nightly"))
            .await
            .unwrap();
        self.lifecycle.start(scan.id).await.unwrap();
        self.lifecycle.begin_scanning(scan.id).await.unwrap()
    }
}

/// Ten claimers racing over a hundred pending jobs: every job is claimed
/// exactly once.
#[tokio::test]
async fn claim_under_contention_is_exclusive() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    let jobs: Vec<NewScanJob> = (0..100)
        .map(|_| NewScanJob::new(scan.id, JobType::ActiveScan))
        .collect();
    h.queue.enqueue_batch(jobs).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..10 {
        let store: Arc<dyn ScanStore> = h.store.clone();
        let now = h.clock.now();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("node-{worker}");
            let mut claimed = Vec::new();
            while let Some(job) = store.claim_next(&worker_id, now).await.unwrap() {
                claimed.push((job.id, job.worker_id.unwrap()));
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    assert_eq!(all.len(), 100);
    let mut ids: Vec<Uuid> = all.iter().map(|(id, _)| *id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 100, "a job was claimed twice");
    assert_eq!(h.queue.pending_count(scan.id).await.unwrap(), 0);
}

/// Pausing stops claims immediately; resuming restores them.
#[tokio::test]
async fn pause_blocks_claims_until_resume() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    for _ in 0..5 {
        h.queue
            .enqueue(NewScanJob::new(scan.id, JobType::Discovery))
            .await
            .unwrap();
    }
    let running_a = h.queue.claim_next("w-0").await.unwrap().unwrap();
    let running_b = h.queue.claim_next("w-0").await.unwrap().unwrap();
    h.queue.mark_running(running_a.id).await.unwrap();
    h.queue.mark_running(running_b.id).await.unwrap();

    h.lifecycle.pause(scan.id).await.unwrap();
    for _ in 0..20 {
        assert!(h.queue.claim_next("w-fresh").await.unwrap().is_none());
    }

    // Running jobs kept their state.
    let job = h.store.get_job(running_a.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let resumed = h.lifecycle.resume(scan.id).await.unwrap();
    assert_eq!(resumed.status, ScanStatus::Scanning);
    assert!(h.queue.claim_next("w-fresh").await.unwrap().is_some());
}

/// A timed-out job fails terminally and is never re-claimed.
#[tokio::test]
async fn timeout_is_terminal() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    let mut new_job = NewScanJob::new(scan.id, JobType::Discovery);
    new_job.max_duration_ms = Some(1_000);
    let job = h.queue.enqueue(new_job).await.unwrap();

    h.queue.claim_next("w-0").await.unwrap().unwrap();
    h.queue.mark_running(job.id).await.unwrap();

    h.clock.advance(Duration::seconds(3));
    let (failed, scan_ids) = h.queue.reset_timed_out().await.unwrap();
    assert_eq!(failed, 1);
    assert_eq!(scan_ids, vec![scan.id]);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_type.as_deref(), Some("timeout"));
    assert_eq!(job.attempts, 1);
    assert!(h.queue.claim_next("w-1").await.unwrap().is_none());
}

/// Dead-node recovery re-arms its jobs and stops the node.
#[tokio::test]
async fn dead_worker_jobs_are_recovered() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    let node = h
        .registry
        .register(&NewWorkerNode {
            id: "edge-host-42".into(),
            hostname: "edge-host".into(),
            worker_count: 2,
            version: Some("0.1.0".into()),
        })
        .await
        .unwrap();

    for _ in 0..4 {
        h.queue
            .enqueue(NewScanJob::new(scan.id, JobType::ActiveScan))
            .await
            .unwrap();
    }
    for slot in 0..2 {
        let worker_id = registry::worker_id(&node.id, slot);
        h.queue.claim_next(&worker_id).await.unwrap().unwrap();
        h.queue.claim_next(&worker_id).await.unwrap().unwrap();
    }

    // No heartbeat past the threshold.
    h.clock.advance(Duration::minutes(5));
    let (stopped, released) = h
        .registry
        .reset_jobs_from_stale_workers(Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(stopped, vec!["edge-host-42".to_string()]);
    assert_eq!(released, 4);

    let node = h.registry.get("edge-host-42").await.unwrap().unwrap();
    assert_eq!(node.status, WorkerNodeStatus::Stopped);

    for job in h.store.list_jobs_for_scan(scan.id).await.unwrap() {
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none() && job.claimed_at.is_none());
    }
}

/// Isolated scans are invisible to the generic claim.
#[tokio::test]
async fn isolated_scan_served_only_by_scoped_claim() {
    let h = Harness::new();
    let ws = h
        .store
        .create_workspace("acme", "Acme Corp")
        .await
        .unwrap();
    let mut new_scan = NewScan::new(ws.id, "isolated");
    new_scan.isolated = true;
    let scan = h.lifecycle.create(&new_scan).await.unwrap();
    h.lifecycle.start(scan.id).await.unwrap();
    h.lifecycle.begin_scanning(scan.id).await.unwrap();

    for _ in 0..10 {
        h.queue
            .enqueue(NewScanJob::new(scan.id, JobType::ActiveScan))
            .await
            .unwrap();
    }

    assert!(h.queue.claim_next("w1").await.unwrap().is_none());
    let job = h
        .queue
        .claim_next_for_scan("w1", scan.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.scan_id, scan.id);
}

/// Exactly one of N concurrent phase CAS attempts wins.
#[tokio::test]
async fn phase_cas_is_exclusive() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    let store: Arc<dyn ScanStore> = h.store.clone();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let s = store.clone();
        let id = scan.id;
        handles.push(tokio::spawn(async move {
            s.compare_and_swap_phase(id, ScanPhase::Crawl, ScanPhase::Fingerprint)
                .await
                .unwrap()
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(
        h.store.get_scan(scan.id).await.unwrap().unwrap().phase,
        ScanPhase::Fingerprint
    );
}

/// Invalid transitions surface the typed precondition error.
#[tokio::test]
async fn invalid_transitions_are_typed_errors() {
    let h = Harness::new();
    let ws = h
        .store
        .create_workspace("acme", "Acme Corp")
        .await
        .unwrap();
    let scan = h
        .lifecycle
        .create(&NewScan::new(ws.id, "nightly"))
        .await
        .unwrap();

    // Pausing a pending scan is refused.
    let err = h.lifecycle.pause(scan.id).await.unwrap_err();
    match err {
        Error::InvalidScanStatus {
            scan_id, current, ..
        } => {
            assert_eq!(scan_id, scan.id);
            assert_eq!(current, ScanStatus::Pending);
        }
        other => panic!("expected InvalidScanStatus, got {other}"),
    }

    // Cancel is absorbing: a second cancel is refused.
    h.lifecycle.cancel(scan.id).await.unwrap();
    assert!(h.lifecycle.cancel(scan.id).await.is_err());
    assert!(h.lifecycle.resume(scan.id).await.is_err());
}

/// The breaker trips after the failure streak and the claim honors the
/// resulting throttle until it expires.
#[tokio::test]
async fn circuit_breaker_throttles_claims() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;
    let store: Arc<dyn ScanStore> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let breaker = CircuitBreaker::new(store, clock);

    for _ in 0..TRIP_THRESHOLD - 1 {
        assert!(breaker.record_failure(scan.id).await.unwrap().is_none());
    }
    let until = breaker.record_failure(scan.id).await.unwrap();
    assert!(until.is_some());

    h.queue
        .enqueue(NewScanJob::new(scan.id, JobType::Discovery))
        .await
        .unwrap();
    assert!(h.queue.claim_next("w").await.unwrap().is_none());

    // Past the deadline the claim flows again, and success clears the streak.
    h.clock.advance(Duration::minutes(2));
    assert!(h.queue.claim_next("w").await.unwrap().is_some());
    breaker.record_success(scan.id).await.unwrap();
    let scan = h.store.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(scan.consecutive_failures, 0);
    assert!(scan.throttled_until.is_none());
}

/// The rate limiter allows `max_rps` per window and reconciles the denial
/// through the scan row.
#[tokio::test]
async fn rate_limiter_reconciles_through_scan_row() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;
    let store: Arc<dyn ScanStore> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let limiter = RateLimiter::new(store, clock);

    for _ in 0..3 {
        assert!(limiter.acquire(scan.id, 3).await.unwrap());
    }
    assert!(!limiter.acquire(scan.id, 3).await.unwrap());
    let scan_row = h.store.get_scan(scan.id).await.unwrap().unwrap();
    assert!(scan_row.throttled_until.is_some());

    // Next window.
    h.clock.advance(Duration::seconds(1));
    assert!(limiter.acquire(scan.id, 3).await.unwrap());
}

struct RecordingHandler {
    outcome: JobOutcome,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, _ctx: &JobContext) -> scanforge_core::Result<JobOutcome> {
        Ok(self.outcome.clone())
    }
}

/// Checkpoint-writing handler that aborts when the write reports a cancel.
struct CheckpointingHandler;

#[async_trait]
impl JobHandler for CheckpointingHandler {
    async fn execute(&self, ctx: &JobContext) -> scanforge_core::Result<JobOutcome> {
        let mut checkpoint = ctx.checkpoint()?;
        checkpoint.current_audit = Some("sql_injection".into());
        checkpoint.last_payload_index = Some(7);
        match ctx.write_checkpoint(&checkpoint).await? {
            scanforge_core::worker::CheckpointAck::Abort => Ok(JobOutcome::Aborted),
            scanforge_core::worker::CheckpointAck::Continue => {
                Ok(JobOutcome::Completed { issues_found: 1 })
            }
        }
    }
}

#[tokio::test]
async fn worker_records_outcomes_and_node_counters() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;
    let node = h
        .registry
        .register(&NewWorkerNode {
            id: "host-1".into(),
            hostname: "host".into(),
            worker_count: 1,
            version: None,
        })
        .await
        .unwrap();

    let ok_job = h
        .queue
        .enqueue(NewScanJob::new(scan.id, JobType::Discovery).with_priority(10))
        .await
        .unwrap();
    let bad_job = h
        .queue
        .enqueue(NewScanJob::new(scan.id, JobType::Discovery))
        .await
        .unwrap();

    let store: Arc<dyn ScanStore> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        JobType::Discovery,
        Arc::new(RecordingHandler {
            outcome: JobOutcome::Completed { issues_found: 2 },
        }),
    );
    let worker = Worker::new(
        store.clone(),
        clock.clone(),
        node.id.clone(),
        registry::worker_id(&node.id, 0),
        handlers,
    );

    // High-priority job first: completes.
    assert!(worker.process_one().await.unwrap());
    let job = h.store.get_job(ok_job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.issues_found, 2);
    assert_eq!(job.worker_id.as_deref(), Some("host-1-0"));

    // Swap in a failing handler for the second job.
    let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        JobType::Discovery,
        Arc::new(RecordingHandler {
            outcome: JobOutcome::Failed {
                error_type: "audit_error".into(),
                error_message: "probe crashed".into(),
            },
        }),
    );
    let worker = Worker::new(
        store,
        clock,
        node.id.clone(),
        registry::worker_id(&node.id, 0),
        handlers,
    );
    assert!(worker.process_one().await.unwrap());
    let job = h.store.get_job(bad_job.id).await.unwrap().unwrap();
    // First failure of three attempts: re-armed.
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_type.as_deref(), Some("audit_error"));

    let node = h.registry.get("host-1").await.unwrap().unwrap();
    assert_eq!(node.jobs_claimed, 2);
    assert_eq!(node.jobs_completed, 1);
    assert_eq!(node.jobs_failed, 1);

    // The failed job re-armed to pending, so one more claim succeeds.
    assert!(h.queue.claim_next("w-x").await.unwrap().is_some());
}

/// A job cancelled between claim and start cannot be resurrected: the
/// claimed → running transition is conditional.
#[tokio::test]
async fn cancel_between_claim_and_start_drops_the_job() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;
    let job = h
        .queue
        .enqueue(NewScanJob::new(scan.id, JobType::ActiveScan))
        .await
        .unwrap();

    let claimed = h.queue.claim_next("w-0").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    h.queue
        .cancel(scan.id, &JobFilter::default())
        .await
        .unwrap();

    assert!(h.queue.mark_running(job.id).await.unwrap().is_none());
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempts, 0);
}

/// Handler that cancels its own scan mid-flight, then hits a safe point.
struct SelfCancellingHandler {
    store: Arc<dyn ScanStore>,
}

#[async_trait]
impl JobHandler for SelfCancellingHandler {
    async fn execute(&self, ctx: &JobContext) -> scanforge_core::Result<JobOutcome> {
        // Cancellation lands while this job is already running, so the job
        // row is untouched; only the checkpoint write can see it.
        self.store
            .cancel_scan(ctx.job.scan_id, Utc::now())
            .await?
            .expect("scan was cancellable");

        let mut checkpoint = ctx.checkpoint()?;
        checkpoint.current_audit = Some("xss".into());
        checkpoint.last_payload_index = Some(3);
        match ctx.write_checkpoint(&checkpoint).await? {
            scanforge_core::worker::CheckpointAck::Abort => Ok(JobOutcome::Aborted),
            scanforge_core::worker::CheckpointAck::Continue => {
                Ok(JobOutcome::Completed { issues_found: 0 })
            }
        }
    }
}

/// A running job observes scan cancellation at its next checkpoint write
/// and aborts without recording a terminal outcome.
#[tokio::test]
async fn running_job_aborts_at_checkpoint_after_cancel() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;
    let node = h
        .registry
        .register(&NewWorkerNode {
            id: "host-2".into(),
            hostname: "host".into(),
            worker_count: 1,
            version: None,
        })
        .await
        .unwrap();
    let job = h
        .queue
        .enqueue(NewScanJob::new(scan.id, JobType::ActiveScan))
        .await
        .unwrap();

    let store: Arc<dyn ScanStore> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        JobType::ActiveScan,
        Arc::new(SelfCancellingHandler {
            store: store.clone(),
        }),
    );
    let worker = Worker::new(
        store,
        clock,
        node.id.clone(),
        registry::worker_id(&node.id, 0),
        handlers,
    );

    assert!(worker.process_one().await.unwrap());

    // Aborted: no terminal outcome recorded, checkpoint persisted for the
    // (hypothetical) next attempt.
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    let checkpoint = JobCheckpoint::from_json(job.checkpoint.as_ref().unwrap()).unwrap();
    assert_eq!(checkpoint.resume_position().unwrap().next_payload_index, 4);
    assert_eq!(
        h.store.get_scan(scan.id).await.unwrap().unwrap().status,
        ScanStatus::Cancelled
    );
}

/// Recovery seeds the next phase job for interrupted scans with no open
/// jobs and leaves paused scans alone.
#[tokio::test]
async fn restart_recovery_seeds_next_phase() {
    let h = Harness::new();
    let scan = h.scanning_scan().await;

    let mut checkpoint = scanforge_core::checkpoint::ScanCheckpoint::default();
    checkpoint.mark_phase_completed(ScanPhase::Crawl);
    checkpoint.mark_phase_completed(ScanPhase::Fingerprint);
    checkpoint.mark_phase_completed(ScanPhase::SiteBehavior);
    h.lifecycle
        .update_checkpoint(scan.id, &checkpoint)
        .await
        .unwrap();

    let paused_scan = h.scanning_scan().await;
    h.lifecycle.pause(paused_scan.id).await.unwrap();

    let report = h.lifecycle.recover(Duration::minutes(10)).await.unwrap();
    assert_eq!(report.scans_examined, 2);
    assert_eq!(report.jobs_enqueued, 1);

    let jobs = h.store.list_jobs_for_scan(scan.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::ApiBehavior);
    // Counters were refreshed along the way.
    let scan = h.store.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(scan.jobs_total, 1);
    assert_eq!(scan.jobs_pending, 1);

    assert!(h
        .store
        .list_jobs_for_scan(paused_scan.id)
        .await
        .unwrap()
        .is_empty());
}

/// Event dedup through the aggregator: n identical saves, one row,
/// occurrence_count == n (invariant 6).
#[tokio::test]
async fn event_aggregator_deduplicates() {
    let h = Harness::new();
    let ws = h
        .store
        .create_workspace("acme", "Acme Corp")
        .await
        .unwrap();
    let store: Arc<dyn ScanStore> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let aggregator = EventAggregator::new(store, clock);

    let event = NewBrowserEvent {
        workspace_id: ws.id,
        scan_id: None,
        event_type: "console.error".into(),
        category: "console".into(),
        url: "https://example.com/checkout".into(),
        data: serde_json::json!({"message": "uncaught TypeError"}),
    };

    let mut last = None;
    for _ in 0..5 {
        h.clock.advance(Duration::milliseconds(10));
        last = Some(aggregator.save(&event).await.unwrap());
    }
    let row = last.unwrap();
    assert_eq!(row.occurrence_count, 5);
    assert!(row.first_seen_at < row.last_seen_at);

    let variant = NewBrowserEvent {
        data: serde_json::json!({"message": "uncaught RangeError"}),
        ..event.clone()
    };
    let outcome = aggregator.save_batch(&[event, variant]).await;
    assert_eq!(outcome.saved, 2);
    assert_eq!(outcome.failed, 0);
}
