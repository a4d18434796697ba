//! PostgreSQL-backed implementation of `ScanStore`.
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) because
//! the tables are created by migrations that may not exist at compile time.
//! The claim and the queue pops use the CTE form of
//! `FOR UPDATE SKIP LOCKED` (planner-independent, safe under concurrent
//! claimers); the OOB promotion locks the test row with a plain
//! `FOR UPDATE` so the decision is serialized.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::{ActivityRollup, JobDurationStats, ThroughputSnapshot};
use crate::oob;
use crate::queue::resolved_max_duration_ms;
use crate::store::ScanStore;
use crate::types::*;

pub struct PostgresScanStore {
    pool: PgPool,
}

impl PostgresScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Config(format!("failed to run migrations: {e}")))?;
        Ok(())
    }
}

// ── Row shims ─────────────────────────────────────────────────
//
// Status/phase columns come back as text and are parsed on conversion, so
// the domain types stay free of sqlx derives.

#[derive(FromRow)]
struct PgScanRow {
    id: Uuid,
    workspace_id: Uuid,
    title: String,
    options: Value,
    status: String,
    phase: String,
    previous_status: Option<String>,
    max_rps: Option<i32>,
    max_concurrent_jobs: Option<i32>,
    consecutive_failures: i32,
    last_failure_at: Option<DateTime<Utc>>,
    throttled_until: Option<DateTime<Utc>>,
    jobs_total: i64,
    jobs_pending: i64,
    jobs_running: i64,
    jobs_completed: i64,
    jobs_failed: i64,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    checkpoint: Option<Value>,
    isolated: bool,
    capture_browser_events: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgScanRow> for Scan {
    type Error = Error;

    fn try_from(row: PgScanRow) -> Result<Self> {
        Ok(Scan {
            id: row.id,
            workspace_id: row.workspace_id,
            title: row.title,
            options: row.options,
            status: row.status.parse()?,
            phase: row.phase.parse()?,
            previous_status: row.previous_status.as_deref().map(str::parse).transpose()?,
            max_rps: row.max_rps,
            max_concurrent_jobs: row.max_concurrent_jobs,
            consecutive_failures: row.consecutive_failures,
            last_failure_at: row.last_failure_at,
            throttled_until: row.throttled_until,
            jobs_total: row.jobs_total,
            jobs_pending: row.jobs_pending,
            jobs_running: row.jobs_running,
            jobs_completed: row.jobs_completed,
            jobs_failed: row.jobs_failed,
            started_at: row.started_at,
            paused_at: row.paused_at,
            completed_at: row.completed_at,
            checkpoint: row.checkpoint,
            isolated: row.isolated,
            capture_browser_events: row.capture_browser_events,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PgScanJobRow {
    id: Uuid,
    scan_id: Uuid,
    status: String,
    job_type: String,
    priority: i32,
    worker_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    max_duration_ms: i64,
    target_host: Option<String>,
    url: Option<String>,
    method: Option<String>,
    history_id: Option<Uuid>,
    websocket_connection_id: Option<Uuid>,
    api_definition_id: Option<Uuid>,
    payload: Option<Value>,
    error_type: Option<String>,
    error_message: Option<String>,
    issues_found: i32,
    checkpoint: Option<Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgScanJobRow> for ScanJob {
    type Error = Error;

    fn try_from(row: PgScanJobRow) -> Result<Self> {
        Ok(ScanJob {
            id: row.id,
            scan_id: row.scan_id,
            status: row.status.parse()?,
            job_type: row.job_type.parse()?,
            priority: row.priority,
            worker_id: row.worker_id,
            claimed_at: row.claimed_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            max_duration_ms: row.max_duration_ms,
            target_host: row.target_host,
            url: row.url,
            method: row.method,
            history_id: row.history_id,
            websocket_connection_id: row.websocket_connection_id,
            api_definition_id: row.api_definition_id,
            payload: row.payload,
            error_type: row.error_type,
            error_message: row.error_message,
            issues_found: row.issues_found,
            checkpoint: row.checkpoint,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct PgWorkerNodeRow {
    id: String,
    hostname: String,
    worker_count: i32,
    status: String,
    started_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    jobs_claimed: i64,
    jobs_completed: i64,
    jobs_failed: i64,
    version: Option<String>,
}

impl TryFrom<PgWorkerNodeRow> for WorkerNode {
    type Error = Error;

    fn try_from(row: PgWorkerNodeRow) -> Result<Self> {
        Ok(WorkerNode {
            id: row.id,
            hostname: row.hostname,
            worker_count: row.worker_count,
            status: row.status.parse()?,
            started_at: row.started_at,
            last_seen_at: row.last_seen_at,
            jobs_claimed: row.jobs_claimed,
            jobs_completed: row.jobs_completed,
            jobs_failed: row.jobs_failed,
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct PgOobTestRow {
    id: Uuid,
    workspace_id: Uuid,
    scan_id: Option<Uuid>,
    scan_job_id: Option<Uuid>,
    history_id: Option<Uuid>,
    code: String,
    test_name: String,
    target: String,
    interaction_full_id: String,
    interaction_domain: String,
    payload: Option<String>,
    insertion_point: Option<String>,
    issue_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<PgOobTestRow> for OobTest {
    fn from(row: PgOobTestRow) -> Self {
        OobTest {
            id: row.id,
            workspace_id: row.workspace_id,
            scan_id: row.scan_id,
            scan_job_id: row.scan_job_id,
            history_id: row.history_id,
            code: row.code,
            test_name: row.test_name,
            target: row.target,
            interaction_full_id: row.interaction_full_id,
            interaction_domain: row.interaction_domain,
            payload: row.payload,
            insertion_point: row.insertion_point,
            issue_id: row.issue_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct PgOobInteractionRow {
    id: Uuid,
    oob_test_id: Option<Uuid>,
    workspace_id: Option<Uuid>,
    issue_id: Option<Uuid>,
    protocol: String,
    full_id: String,
    qtype: Option<String>,
    raw_request: Option<String>,
    raw_response: Option<String>,
    remote_address: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<PgOobInteractionRow> for OobInteraction {
    fn from(row: PgOobInteractionRow) -> Self {
        OobInteraction {
            id: row.id,
            oob_test_id: row.oob_test_id,
            workspace_id: row.workspace_id,
            issue_id: row.issue_id,
            protocol: row.protocol,
            full_id: row.full_id,
            qtype: row.qtype,
            raw_request: row.raw_request,
            raw_response: row.raw_response,
            remote_address: row.remote_address,
            timestamp: row.timestamp,
        }
    }
}

#[derive(FromRow)]
struct PgIssueRow {
    id: Uuid,
    workspace_id: Uuid,
    scan_id: Option<Uuid>,
    code: String,
    title: String,
    description: String,
    details: String,
    severity: String,
    confidence: i32,
    url: Option<String>,
    request: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgIssueRow> for Issue {
    type Error = Error;

    fn try_from(row: PgIssueRow) -> Result<Self> {
        Ok(Issue {
            id: row.id,
            workspace_id: row.workspace_id,
            scan_id: row.scan_id,
            code: row.code,
            title: row.title,
            description: row.description,
            details: row.details,
            severity: row.severity.parse()?,
            confidence: row.confidence,
            url: row.url,
            request: row.request,
            response: row.response,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PgBrowserEventRow {
    id: Uuid,
    workspace_id: Uuid,
    scan_id: Option<Uuid>,
    event_type: String,
    category: String,
    url: String,
    data: Value,
    content_hash: String,
    occurrence_count: i64,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<PgBrowserEventRow> for BrowserEvent {
    fn from(row: PgBrowserEventRow) -> Self {
        BrowserEvent {
            id: row.id,
            workspace_id: row.workspace_id,
            scan_id: row.scan_id,
            event_type: row.event_type,
            category: row.category,
            url: row.url,
            data: row.data,
            content_hash: row.content_hash,
            occurrence_count: row.occurrence_count,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(FromRow)]
struct PgHistoryRow {
    id: Uuid,
    workspace_id: Uuid,
    scan_id: Option<Uuid>,
    url: String,
    method: String,
    status_code: Option<i32>,
    source: String,
    raw_request: Option<Vec<u8>>,
    raw_response: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgHistoryRow> for History {
    type Error = Error;

    fn try_from(row: PgHistoryRow) -> Result<Self> {
        Ok(History {
            id: row.id,
            workspace_id: row.workspace_id,
            scan_id: row.scan_id,
            url: row.url,
            method: row.method,
            status_code: row.status_code,
            source: row.source.parse()?,
            raw_request: row.raw_request,
            raw_response: row.raw_response,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct PgSiteBehaviorRow {
    id: Uuid,
    scan_id: Uuid,
    base_url: String,
    status_code: i32,
    response_hash: String,
    content_type: Option<String>,
    body_size: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PgSiteBehaviorRow> for SiteBehaviorResult {
    fn from(row: PgSiteBehaviorRow) -> Self {
        SiteBehaviorResult {
            id: row.id,
            scan_id: row.scan_id,
            base_url: row.base_url,
            fingerprint: BehaviorFingerprint {
                status_code: row.status_code,
                response_hash: row.response_hash,
                content_type: row.content_type,
                body_size: row.body_size,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PgApiBehaviorRow {
    id: Uuid,
    scan_id: Option<Uuid>,
    api_definition_id: Uuid,
    behavior_class: String,
    status_code: i32,
    response_hash: String,
    content_type: Option<String>,
    body_size: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgApiBehaviorRow> for ApiBehaviorResult {
    type Error = Error;

    fn try_from(row: PgApiBehaviorRow) -> Result<Self> {
        Ok(ApiBehaviorResult {
            id: row.id,
            scan_id: row.scan_id,
            api_definition_id: row.api_definition_id,
            behavior_class: row.behavior_class.parse()?,
            fingerprint: BehaviorFingerprint {
                status_code: row.status_code,
                response_hash: row.response_hash,
                content_type: row.content_type,
                body_size: row.body_size,
            },
            created_at: row.created_at,
        })
    }
}

fn api_scan_from_row(row: &sqlx::postgres::PgRow) -> ApiScan {
    ApiScan {
        id: row.get("id"),
        scan_id: row.get("scan_id"),
        api_definition_id: row.get("api_definition_id"),
        status: row.get("status"),
        endpoints_probed: row.get("endpoints_probed"),
        created_at: row.get("created_at"),
    }
}

fn map_unique(e: sqlx::Error, message: String) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Constraint(message),
        _ => Error::Database(e),
    }
}

#[async_trait]
impl ScanStore for PostgresScanStore {
    // ── Workspaces ──

    async fn create_workspace(&self, code: &str, name: &str) -> Result<Workspace> {
        let row = sqlx::query(
            r#"
            INSERT INTO workspaces (id, code, name)
            VALUES ($1, $2, $3)
            RETURNING id, code, name, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(code)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, format!("workspace code '{code}' already exists")))?;

        Ok(Workspace {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        let row = sqlx::query("SELECT id, code, name, created_at FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Workspace {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        }))
    }

    // ── Scans ──

    async fn create_scan(&self, scan: &NewScan) -> Result<Scan> {
        let row = sqlx::query_as::<_, PgScanRow>(
            r#"
            INSERT INTO scans (
                id, workspace_id, title, options, max_rps, max_concurrent_jobs,
                isolated, capture_browser_events
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scan.workspace_id)
        .bind(&scan.title)
        .bind(&scan.options)
        .bind(scan.max_rps)
        .bind(scan.max_concurrent_jobs)
        .bind(scan.isolated)
        .bind(scan.capture_browser_events)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>("SELECT * FROM scans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn list_scans_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<Scan>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, PgScanRow>(
            "SELECT * FROM scans WHERE status = ANY($1) ORDER BY created_at",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn start_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = 'crawling', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn begin_scanning(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = 'scanning', updated_at = $2
            WHERE id = $1 AND status = 'crawling'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn pause_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET previous_status = status, status = 'paused', paused_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('crawling', 'scanning')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn resume_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = COALESCE(previous_status, 'scanning'),
                previous_status = NULL,
                paused_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'paused'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn cancel_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<(Scan, u64)>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status NOT IN ('completed', 'cancelled', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let cancelled = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'cancelled', completed_at = $2
            WHERE scan_id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(Some((row.try_into()?, cancelled)))
    }

    async fn complete_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = 'completed', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('crawling', 'scanning')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn fail_scan(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Scan>> {
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET status = 'failed', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status NOT IN ('completed', 'cancelled', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn compare_and_swap_phase(
        &self,
        id: Uuid,
        expected: ScanPhase,
        new: ScanPhase,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scans SET phase = $3, updated_at = now() WHERE id = $1 AND phase = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_scan_counts(&self, id: Uuid) -> Result<Option<Scan>> {
        // Claimed jobs count as running for progress purposes.
        sqlx::query_as::<_, PgScanRow>(
            r#"
            UPDATE scans
            SET jobs_total = stats.total,
                jobs_pending = stats.pending,
                jobs_running = stats.running,
                jobs_completed = stats.completed,
                jobs_failed = stats.failed
            FROM (
                SELECT
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                    COUNT(*) FILTER (WHERE status IN ('claimed', 'running')) AS running,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed
                FROM scan_jobs
                WHERE scan_id = $1
            ) AS stats
            WHERE scans.id = $1
            RETURNING scans.*
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn update_scan_checkpoint(&self, id: Uuid, checkpoint: &Value) -> Result<()> {
        let result = sqlx::query("UPDATE scans SET checkpoint = $2 WHERE id = $1")
            .bind(id)
            .bind(checkpoint)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("scan", id));
        }
        Ok(())
    }

    async fn set_scan_throttled_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE scans SET throttled_until = $2 WHERE id = $1")
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("scan", id));
        }
        Ok(())
    }

    async fn bump_scan_failure(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<i32>> {
        let row = sqlx::query(
            r#"
            UPDATE scans
            SET consecutive_failures = consecutive_failures + 1, last_failure_at = $2
            WHERE id = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("consecutive_failures")))
    }

    async fn reset_scan_failures(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE scans SET consecutive_failures = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Jobs ──

    async fn insert_job(&self, job: &NewScanJob) -> Result<ScanJob> {
        let row = sqlx::query_as::<_, PgScanJobRow>(
            r#"
            INSERT INTO scan_jobs (
                id, scan_id, job_type, priority, max_attempts, max_duration_ms,
                target_host, url, method, history_id, websocket_connection_id,
                api_definition_id, payload
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.scan_id)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(resolved_max_duration_ms(job))
        .bind(&job.target_host)
        .bind(&job.url)
        .bind(&job.method)
        .bind(job.history_id)
        .bind(job.websocket_connection_id)
        .bind(job.api_definition_id)
        .bind(&job.payload)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn insert_jobs(&self, jobs: &[NewScanJob]) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = Uuid::now_v7();
            sqlx::query(
                r#"
                INSERT INTO scan_jobs (
                    id, scan_id, job_type, priority, max_attempts, max_duration_ms,
                    target_host, url, method, history_id, websocket_connection_id,
                    api_definition_id, payload
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(id)
            .bind(job.scan_id)
            .bind(job.job_type.as_str())
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(resolved_max_duration_ms(job))
            .bind(&job.target_host)
            .bind(&job.url)
            .bind(&job.method)
            .bind(job.history_id)
            .bind(job.websocket_connection_id)
            .bind(job.api_definition_id)
            .bind(&job.payload)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>> {
        sqlx::query_as::<_, PgScanJobRow>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn list_jobs_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanJob>> {
        let rows = sqlx::query_as::<_, PgScanJobRow>(
            "SELECT * FROM scan_jobs WHERE scan_id = $1 ORDER BY created_at, id",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ScanJob>> {
        sqlx::query_as::<_, PgScanJobRow>(
            r#"
            WITH next AS (
                SELECT j.id
                FROM scan_jobs j
                JOIN scans s ON s.id = j.scan_id
                WHERE j.status = 'pending'
                  AND s.status IN ('crawling', 'scanning')
                  AND s.isolated = FALSE
                  AND (s.throttled_until IS NULL OR s.throttled_until <= $2)
                  AND (
                      s.max_concurrent_jobs IS NULL
                      OR (
                          SELECT COUNT(*)
                          FROM scan_jobs r
                          WHERE r.scan_id = s.id AND r.status IN ('claimed', 'running')
                      ) < s.max_concurrent_jobs
                  )
                ORDER BY j.priority DESC, j.created_at ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE scan_jobs
            SET status = 'claimed', worker_id = $1, claimed_at = $2
            FROM next
            WHERE scan_jobs.id = next.id
            RETURNING scan_jobs.*
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn claim_next_for_scan(
        &self,
        worker_id: &str,
        scan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        sqlx::query_as::<_, PgScanJobRow>(
            r#"
            WITH next AS (
                SELECT j.id
                FROM scan_jobs j
                JOIN scans s ON s.id = j.scan_id
                WHERE j.status = 'pending'
                  AND j.scan_id = $3
                  AND s.status IN ('crawling', 'scanning')
                  AND (s.throttled_until IS NULL OR s.throttled_until <= $2)
                  AND (
                      s.max_concurrent_jobs IS NULL
                      OR (
                          SELECT COUNT(*)
                          FROM scan_jobs r
                          WHERE r.scan_id = s.id AND r.status IN ('claimed', 'running')
                      ) < s.max_concurrent_jobs
                  )
                ORDER BY j.priority DESC, j.created_at ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE scan_jobs
            SET status = 'claimed', worker_id = $1, claimed_at = $2
            FROM next
            WHERE scan_jobs.id = next.id
            RETURNING scan_jobs.*
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn mark_job_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ScanJob>> {
        sqlx::query_as::<_, PgScanJobRow>(
            r#"
            UPDATE scan_jobs
            SET status = 'running', started_at = $2, attempts = attempts + 1
            WHERE id = $1 AND status = 'claimed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn mark_job_completed(
        &self,
        id: Uuid,
        issues_found: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        sqlx::query_as::<_, PgScanJobRow>(
            r#"
            UPDATE scan_jobs
            SET status = 'completed', completed_at = $2, issues_found = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(issues_found)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn mark_job_failed(
        &self,
        id: Uuid,
        error_type: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanJob>> {
        // Below max_attempts the job re-arms to pending; at the cap the
        // failure is terminal.
        sqlx::query_as::<_, PgScanJobRow>(
            r#"
            UPDATE scan_jobs
            SET error_type = $2,
                error_message = $3,
                status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                worker_id = CASE WHEN attempts < max_attempts THEN NULL ELSE worker_id END,
                claimed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE claimed_at END,
                started_at = CASE WHEN attempts < max_attempts THEN NULL ELSE started_at END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $4 END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error_type)
        .bind(error_message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn cancel_jobs(
        &self,
        scan_id: Uuid,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'cancelled', completed_at = $2
            WHERE scan_id = $1
              AND status IN ('pending', 'claimed')
              AND ($3::text IS NULL OR job_type = $3)
            "#,
        )
        .bind(scan_id)
        .bind(now)
        .bind(filter.job_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'pending', worker_id = NULL, claimed_at = NULL, started_at = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_timed_out(&self, now: DateTime<Utc>) -> Result<(u64, Vec<Uuid>)> {
        let rows = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'failed',
                error_type = 'timeout',
                error_message = 'exceeded max duration of ' || max_duration_ms || 'ms',
                completed_at = $1
            WHERE status IN ('claimed', 'running')
              AND started_at IS NOT NULL
              AND started_at + make_interval(secs => max_duration_ms / 1000.0) < $1
            RETURNING scan_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let failed = rows.len() as u64;
        let mut scan_ids: Vec<Uuid> = Vec::new();
        for row in rows {
            let scan_id: Uuid = row.get("scan_id");
            if !scan_ids.contains(&scan_id) {
                scan_ids.push(scan_id);
            }
        }
        Ok((failed, scan_ids))
    }

    async fn release_by_worker(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'pending', worker_id = NULL, claimed_at = NULL, started_at = NULL
            WHERE worker_id = $1 AND status IN ('claimed', 'running')
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_by_worker_node(&self, node_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'pending', worker_id = NULL, claimed_at = NULL, started_at = NULL
            WHERE worker_id LIKE $1 || '-%' AND status IN ('claimed', 'running')
            "#,
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn job_stats(&self, scan_id: Uuid) -> Result<BTreeMap<JobStatus, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM scan_jobs WHERE scan_id = $1 GROUP BY status",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            stats.insert(status.parse::<JobStatus>()?, count);
        }
        Ok(stats)
    }

    async fn pending_job_count(&self, scan_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM scan_jobs WHERE scan_id = $1 AND status = 'pending'",
        )
        .bind(scan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    async fn update_job_checkpoint(
        &self,
        id: Uuid,
        checkpoint: &Value,
    ) -> Result<Option<JobStatus>> {
        let row = sqlx::query(
            "UPDATE scan_jobs SET checkpoint = $2 WHERE id = $1 RETURNING status",
        )
        .bind(id)
        .bind(checkpoint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let status: String = r.get("status");
            status.parse()
        })
        .transpose()
    }

    // ── Worker nodes ──

    async fn register_node(
        &self,
        node: &NewWorkerNode,
        now: DateTime<Utc>,
    ) -> Result<WorkerNode> {
        let row = sqlx::query_as::<_, PgWorkerNodeRow>(
            r#"
            INSERT INTO worker_nodes (
                id, hostname, worker_count, status, started_at, last_seen_at,
                jobs_claimed, jobs_completed, jobs_failed, version
            ) VALUES ($1, $2, $3, 'running', $4, $4, 0, 0, 0, $5)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                worker_count = EXCLUDED.worker_count,
                status = 'running',
                started_at = EXCLUDED.started_at,
                last_seen_at = EXCLUDED.last_seen_at,
                jobs_claimed = 0,
                jobs_completed = 0,
                jobs_failed = 0,
                version = EXCLUDED.version
            RETURNING *
            "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(node.worker_count)
        .bind(now)
        .bind(&node.version)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_node(&self, id: &str) -> Result<Option<WorkerNode>> {
        sqlx::query_as::<_, PgWorkerNodeRow>("SELECT * FROM worker_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn heartbeat_node(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE worker_nodes SET last_seen_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bump_node_counter(
        &self,
        id: &str,
        counter: NodeCounter,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = match counter {
            NodeCounter::Claimed => {
                "UPDATE worker_nodes SET jobs_claimed = jobs_claimed + 1, last_seen_at = $2 WHERE id = $1"
            }
            NodeCounter::Completed => {
                "UPDATE worker_nodes SET jobs_completed = jobs_completed + 1, last_seen_at = $2 WHERE id = $1"
            }
            NodeCounter::Failed => {
                "UPDATE worker_nodes SET jobs_failed = jobs_failed + 1, last_seen_at = $2 WHERE id = $1"
            }
        };
        let result = sqlx::query(sql).bind(id).bind(now).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("worker node", id));
        }
        Ok(())
    }

    async fn set_node_status(&self, id: &str, status: WorkerNodeStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE worker_nodes SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn deregister_node(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM worker_nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>> {
        let rows = sqlx::query_as::<_, PgWorkerNodeRow>(
            "SELECT * FROM worker_nodes WHERE status = 'running' AND last_seen_at > $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn stale_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerNode>> {
        let rows = sqlx::query_as::<_, PgWorkerNodeRow>(
            "SELECT * FROM worker_nodes WHERE status = 'running' AND last_seen_at <= $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_stale_nodes_stopped(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE worker_nodes
            SET status = 'stopped'
            WHERE status = 'running' AND last_seen_at <= $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn delete_stopped_nodes(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM worker_nodes WHERE status = 'stopped' AND last_seen_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── OOB correlation ──

    async fn insert_oob_test(&self, test: &NewOobTest) -> Result<OobTest> {
        let payload = if test.payload.is_empty() {
            None
        } else {
            Some(oob::encode_payload(&test.payload))
        };
        let row = sqlx::query_as::<_, PgOobTestRow>(
            r#"
            INSERT INTO oob_tests (
                id, workspace_id, scan_id, scan_job_id, history_id, code,
                test_name, target, interaction_full_id, interaction_domain,
                payload, insertion_point
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(test.workspace_id)
        .bind(test.scan_id)
        .bind(test.scan_job_id)
        .bind(test.history_id)
        .bind(&test.code)
        .bind(&test.test_name)
        .bind(&test.target)
        .bind(oob::normalize_full_id(&test.interaction_full_id))
        .bind(&test.interaction_domain)
        .bind(payload)
        .bind(&test.insertion_point)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_oob_test(&self, id: Uuid) -> Result<Option<OobTest>> {
        let row = sqlx::query_as::<_, PgOobTestRow>("SELECT * FROM oob_tests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn correlate_oob_interaction(
        &self,
        full_id_normalized: &str,
        interaction: &NewOobInteraction,
    ) -> Result<CorrelationOutcome> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes the promote-or-append decision across
        // concurrent arrivals for the same identifier.
        let test = sqlx::query_as::<_, PgOobTestRow>(
            r#"
            SELECT * FROM oob_tests
            WHERE interaction_full_id = $1
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(full_id_normalized)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(test) = test.map(OobTest::from) else {
            return Ok(CorrelationOutcome::NoMatch);
        };

        if let Some(issue_id) = test.issue_id {
            sqlx::query(
                r#"
                INSERT INTO oob_interactions (
                    id, oob_test_id, workspace_id, issue_id, protocol, full_id,
                    qtype, raw_request, raw_response, remote_address, "timestamp"
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(test.id)
            .bind(test.workspace_id)
            .bind(issue_id)
            .bind(&interaction.protocol)
            .bind(&interaction.full_id)
            .bind(&interaction.qtype)
            .bind(&interaction.raw_request)
            .bind(&interaction.raw_response)
            .bind(&interaction.remote_address)
            .bind(interaction.timestamp)
            .execute(&mut *tx)
            .await?;

            let rows = sqlx::query_as::<_, PgOobInteractionRow>(
                r#"SELECT * FROM oob_interactions WHERE issue_id = $1 ORDER BY "timestamp" ASC"#,
            )
            .bind(issue_id)
            .fetch_all(&mut *tx)
            .await?;
            let all: Vec<OobInteraction> = rows.into_iter().map(Into::into).collect();

            sqlx::query("UPDATE issues SET details = $2, updated_at = now() WHERE id = $1")
                .bind(issue_id)
                .bind(oob::render_details(&test, &all))
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            return Ok(CorrelationOutcome::Appended { issue_id });
        }

        // First interaction for this test: promote to a new issue.
        let (request, response): (Option<Vec<u8>>, Option<Vec<u8>>) = match test.history_id {
            Some(history_id) => {
                let row = sqlx::query(
                    "SELECT raw_request, raw_response FROM histories WHERE id = $1",
                )
                .bind(history_id)
                .fetch_optional(&mut *tx)
                .await?;
                match row {
                    Some(row) => (row.get("raw_request"), row.get("raw_response")),
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        let issue_id = Uuid::now_v7();
        let interaction_id = Uuid::now_v7();
        let template = oob::resolve_template(&test.code);

        let inserted = sqlx::query_as::<_, PgOobInteractionRow>(
            r#"
            INSERT INTO oob_interactions (
                id, oob_test_id, workspace_id, issue_id, protocol, full_id,
                qtype, raw_request, raw_response, remote_address, "timestamp"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(interaction_id)
        .bind(test.id)
        .bind(test.workspace_id)
        .bind(issue_id)
        .bind(&interaction.protocol)
        .bind(&interaction.full_id)
        .bind(&interaction.qtype)
        .bind(&interaction.raw_request)
        .bind(&interaction.raw_response)
        .bind(&interaction.remote_address)
        .bind(interaction.timestamp)
        .fetch_one(&mut *tx)
        .await?;

        let details =
            oob::render_details(&test, std::slice::from_ref(&OobInteraction::from(inserted)));

        sqlx::query(
            r#"
            INSERT INTO issues (
                id, workspace_id, scan_id, code, title, description, details,
                severity, confidence, url, request, response
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(issue_id)
        .bind(test.workspace_id)
        .bind(test.scan_id)
        .bind(&test.code)
        .bind(template.title)
        .bind(template.description)
        .bind(details)
        .bind(template.severity.as_str())
        .bind(oob::OOB_CONFIDENCE)
        .bind(&test.target)
        .bind(request)
        .bind(response)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE oob_tests SET issue_id = $2 WHERE id = $1")
            .bind(test.id)
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CorrelationOutcome::Promoted { issue_id })
    }

    async fn get_issue(&self, id: Uuid) -> Result<Option<Issue>> {
        sqlx::query_as::<_, PgIssueRow>("SELECT * FROM issues WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn interactions_for_issue(&self, issue_id: Uuid) -> Result<Vec<OobInteraction>> {
        let rows = sqlx::query_as::<_, PgOobInteractionRow>(
            r#"SELECT * FROM oob_interactions WHERE issue_id = $1 ORDER BY "timestamp" ASC"#,
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ── Browser events ──

    async fn upsert_browser_event(
        &self,
        content_hash: &str,
        event: &NewBrowserEvent,
        now: DateTime<Utc>,
    ) -> Result<BrowserEvent> {
        // The conflict target must name the matching partial index, so the
        // scan-scoped and workspace-scoped upserts are separate statements.
        let row = if event.scan_id.is_some() {
            sqlx::query_as::<_, PgBrowserEventRow>(
                r#"
                INSERT INTO browser_events (
                    id, workspace_id, scan_id, event_type, category, url, data,
                    content_hash, occurrence_count, first_seen_at, last_seen_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $9)
                ON CONFLICT (content_hash, workspace_id, scan_id) WHERE scan_id IS NOT NULL
                DO UPDATE SET
                    occurrence_count = browser_events.occurrence_count + 1,
                    last_seen_at = EXCLUDED.last_seen_at
                RETURNING *
                "#,
            )
        } else {
            sqlx::query_as::<_, PgBrowserEventRow>(
                r#"
                INSERT INTO browser_events (
                    id, workspace_id, scan_id, event_type, category, url, data,
                    content_hash, occurrence_count, first_seen_at, last_seen_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $9)
                ON CONFLICT (content_hash, workspace_id) WHERE scan_id IS NULL
                DO UPDATE SET
                    occurrence_count = browser_events.occurrence_count + 1,
                    last_seen_at = EXCLUDED.last_seen_at
                RETURNING *
                "#,
            )
        }
        .bind(Uuid::now_v7())
        .bind(event.workspace_id)
        .bind(event.scan_id)
        .bind(&event.event_type)
        .bind(&event.category)
        .bind(&event.url)
        .bind(&event.data)
        .bind(content_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn find_browser_event(
        &self,
        content_hash: &str,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
    ) -> Result<Option<BrowserEvent>> {
        let row = sqlx::query_as::<_, PgBrowserEventRow>(
            r#"
            SELECT * FROM browser_events
            WHERE content_hash = $1 AND workspace_id = $2 AND scan_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(content_hash)
        .bind(workspace_id)
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    // ── Histories / connections / API surface ──

    async fn insert_history(&self, history: &NewHistory) -> Result<History> {
        let row = sqlx::query_as::<_, PgHistoryRow>(
            r#"
            INSERT INTO histories (
                id, workspace_id, scan_id, url, method, status_code, source,
                raw_request, raw_response
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(history.workspace_id)
        .bind(history.scan_id)
        .bind(&history.url)
        .bind(&history.method)
        .bind(history.status_code)
        .bind(history.source.as_str())
        .bind(&history.raw_request)
        .bind(&history.raw_response)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn insert_websocket_connection(
        &self,
        workspace_id: Uuid,
        scan_id: Option<Uuid>,
        url: &str,
    ) -> Result<WebSocketConnection> {
        let row = sqlx::query(
            r#"
            INSERT INTO websocket_connections (id, workspace_id, scan_id, url)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workspace_id, scan_id, url, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workspace_id)
        .bind(scan_id)
        .bind(url)
        .fetch_one(&self.pool)
        .await?;
        Ok(WebSocketConnection {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            scan_id: row.get("scan_id"),
            url: row.get("url"),
            created_at: row.get("created_at"),
        })
    }

    async fn insert_api_definition(
        &self,
        workspace_id: Uuid,
        name: &str,
        source_url: Option<&str>,
        schema: &Value,
    ) -> Result<ApiDefinition> {
        let row = sqlx::query(
            r#"
            INSERT INTO api_definitions (id, workspace_id, name, source_url, schema)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, workspace_id, name, source_url, schema, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workspace_id)
        .bind(name)
        .bind(source_url)
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(ApiDefinition {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            name: row.get("name"),
            source_url: row.get("source_url"),
            schema: row.get("schema"),
            created_at: row.get("created_at"),
        })
    }

    async fn insert_api_endpoint(
        &self,
        api_definition_id: Uuid,
        path: &str,
        method: &str,
        parameters: &Value,
    ) -> Result<ApiEndpoint> {
        let row = sqlx::query(
            r#"
            INSERT INTO api_endpoints (id, api_definition_id, path, method, parameters)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, api_definition_id, path, method, parameters
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(api_definition_id)
        .bind(path)
        .bind(method)
        .bind(parameters)
        .fetch_one(&self.pool)
        .await?;
        Ok(ApiEndpoint {
            id: row.get("id"),
            api_definition_id: row.get("api_definition_id"),
            path: row.get("path"),
            method: row.get("method"),
            parameters: row.get("parameters"),
        })
    }

    async fn create_api_scan(
        &self,
        scan_id: Uuid,
        api_definition_id: Uuid,
    ) -> Result<ApiScan> {
        let row = sqlx::query(
            r#"
            INSERT INTO api_scans (id, scan_id, api_definition_id)
            VALUES ($1, $2, $3)
            RETURNING id, scan_id, api_definition_id, status, endpoints_probed, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scan_id)
        .bind(api_definition_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(api_scan_from_row(&row))
    }

    async fn update_api_scan(
        &self,
        id: Uuid,
        status: &str,
        endpoints_probed: i32,
    ) -> Result<Option<ApiScan>> {
        let row = sqlx::query(
            r#"
            UPDATE api_scans
            SET status = $2, endpoints_probed = $3
            WHERE id = $1
            RETURNING id, scan_id, api_definition_id, status, endpoints_probed, created_at
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(endpoints_probed)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(api_scan_from_row))
    }

    async fn list_api_scans(&self, scan_id: Uuid) -> Result<Vec<ApiScan>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scan_id, api_definition_id, status, endpoints_probed, created_at
            FROM api_scans
            WHERE scan_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(api_scan_from_row).collect())
    }

    async fn upsert_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<SiteBehaviorResult> {
        let row = sqlx::query_as::<_, PgSiteBehaviorRow>(
            r#"
            INSERT INTO site_behavior_results (
                id, scan_id, base_url, status_code, response_hash, content_type,
                body_size, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (scan_id, base_url) DO UPDATE SET
                status_code = EXCLUDED.status_code,
                response_hash = EXCLUDED.response_hash,
                content_type = EXCLUDED.content_type,
                body_size = EXCLUDED.body_size,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scan_id)
        .bind(base_url)
        .bind(fingerprint.status_code)
        .bind(&fingerprint.response_hash)
        .bind(&fingerprint.content_type)
        .bind(fingerprint.body_size)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_site_behavior(
        &self,
        scan_id: Uuid,
        base_url: &str,
    ) -> Result<Option<SiteBehaviorResult>> {
        let row = sqlx::query_as::<_, PgSiteBehaviorRow>(
            "SELECT * FROM site_behavior_results WHERE scan_id = $1 AND base_url = $2",
        )
        .bind(scan_id)
        .bind(base_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_api_behavior(
        &self,
        scan_id: Option<Uuid>,
        api_definition_id: Uuid,
        behavior_class: BehaviorClass,
        fingerprint: &BehaviorFingerprint,
        now: DateTime<Utc>,
    ) -> Result<ApiBehaviorResult> {
        let row = sqlx::query_as::<_, PgApiBehaviorRow>(
            r#"
            INSERT INTO api_behavior_results (
                id, scan_id, api_definition_id, behavior_class, status_code,
                response_hash, content_type, body_size, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(scan_id)
        .bind(api_definition_id)
        .bind(behavior_class.as_str())
        .bind(fingerprint.status_code)
        .bind(&fingerprint.response_hash)
        .bind(&fingerprint.content_type)
        .bind(fingerprint.body_size)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn list_api_behavior(&self, api_definition_id: Uuid) -> Result<Vec<ApiBehaviorResult>> {
        let rows = sqlx::query_as::<_, PgApiBehaviorRow>(
            "SELECT * FROM api_behavior_results WHERE api_definition_id = $1 ORDER BY created_at",
        )
        .bind(api_definition_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_proxy_service(
        &self,
        workspace_id: Uuid,
        name: &str,
        port: i32,
    ) -> Result<ProxyService> {
        let row = sqlx::query(
            r#"
            INSERT INTO proxy_services (id, workspace_id, name, port)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workspace_id, name, port, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workspace_id)
        .bind(name)
        .bind(port)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, format!("proxy service port {port} is already in use")))?;
        Ok(ProxyService {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            name: row.get("name"),
            port: row.get("port"),
            created_at: row.get("created_at"),
        })
    }

    // ── Metrics ──

    async fn throughput_snapshot(&self, now: DateTime<Utc>) -> Result<ThroughputSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed'
                    AND completed_at > $1 - interval '1 minute') AS completed_last_minute,
                COUNT(*) FILTER (WHERE status = 'completed'
                    AND completed_at > $1 - interval '5 minutes') AS completed_last_5m,
                COUNT(*) FILTER (WHERE status = 'completed'
                    AND completed_at > $1 - interval '1 hour') AS completed_last_hour,
                COUNT(*) FILTER (WHERE status = 'failed'
                    AND completed_at > $1 - interval '1 hour') AS failed_last_hour,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status IN ('claimed', 'running')) AS in_flight
            FROM scan_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let completed_last_5m: i64 = row.get("completed_last_5m");
        let completed_last_hour: i64 = row.get("completed_last_hour");
        let failed_last_hour: i64 = row.get("failed_last_hour");
        let denom = completed_last_hour + failed_last_hour;

        Ok(ThroughputSnapshot {
            completed_last_minute: row.get("completed_last_minute"),
            completed_last_5m,
            completed_last_hour,
            jobs_per_minute: completed_last_5m as f64 / 5.0,
            success_rate: (denom > 0).then(|| completed_last_hour as f64 / denom as f64),
            pending: row.get("pending"),
            in_flight: row.get("in_flight"),
        })
    }

    async fn duration_stats(&self, now: DateTime<Utc>) -> Result<Vec<JobDurationStats>> {
        let rows = sqlx::query(
            r#"
            SELECT job_type,
                   COUNT(*) AS count,
                   MIN(dur_ms) AS min_ms,
                   MAX(dur_ms) AS max_ms,
                   AVG(dur_ms) AS avg_ms,
                   percentile_cont(0.50) WITHIN GROUP (ORDER BY dur_ms) AS p50_ms,
                   percentile_cont(0.95) WITHIN GROUP (ORDER BY dur_ms) AS p95_ms,
                   percentile_cont(0.99) WITHIN GROUP (ORDER BY dur_ms) AS p99_ms
            FROM (
                SELECT job_type,
                       EXTRACT(EPOCH FROM (completed_at - started_at))::double precision
                           * 1000.0 AS dur_ms
                FROM scan_jobs
                WHERE status = 'completed'
                  AND started_at IS NOT NULL
                  AND completed_at > $1 - interval '1 hour'
            ) d
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            let job_type: String = row.get("job_type");
            let min_ms: f64 = row.get("min_ms");
            let max_ms: f64 = row.get("max_ms");
            stats.push(JobDurationStats {
                job_type: job_type.parse()?,
                count: row.get("count"),
                min_ms: min_ms as i64,
                max_ms: max_ms as i64,
                avg_ms: row.get("avg_ms"),
                p50_ms: row.get("p50_ms"),
                p95_ms: row.get("p95_ms"),
                p99_ms: row.get("p99_ms"),
            });
        }
        Ok(stats)
    }

    async fn scan_rollup(&self, scan_id: Uuid) -> Result<ActivityRollup> {
        let issue_rows = sqlx::query(
            "SELECT severity, COUNT(*) AS count FROM issues WHERE scan_id = $1 GROUP BY severity",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        let history_rows = sqlx::query(
            "SELECT source, COUNT(*) AS count FROM histories WHERE scan_id = $1 GROUP BY source",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        rollup_from_rows(&issue_rows, &history_rows)
    }

    async fn workspace_rollup(&self, workspace_id: Uuid) -> Result<ActivityRollup> {
        let issue_rows = sqlx::query(
            "SELECT severity, COUNT(*) AS count FROM issues WHERE workspace_id = $1 GROUP BY severity",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        let history_rows = sqlx::query(
            "SELECT source, COUNT(*) AS count FROM histories WHERE workspace_id = $1 GROUP BY source",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        rollup_from_rows(&issue_rows, &history_rows)
    }
}

fn rollup_from_rows(
    issue_rows: &[sqlx::postgres::PgRow],
    history_rows: &[sqlx::postgres::PgRow],
) -> Result<ActivityRollup> {
    let mut out = ActivityRollup::default();
    for row in issue_rows {
        let severity: String = row.get("severity");
        let count: i64 = row.get("count");
        match severity.parse::<Severity>()? {
            Severity::Unknown => out.issues.unknown = count,
            Severity::Info => out.issues.info = count,
            Severity::Low => out.issues.low = count,
            Severity::Medium => out.issues.medium = count,
            Severity::High => out.issues.high = count,
            Severity::Critical => out.issues.critical = count,
        }
    }
    for row in history_rows {
        let source: String = row.get("source");
        let count: i64 = row.get("count");
        match source.parse::<HistorySource>()? {
            HistorySource::Crawler => out.requests.crawler = count,
            HistorySource::Scanner => out.requests.scanner = count,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    async fn setup() -> (PgPool, Arc<PostgresScanStore>) {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///scanforge".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");

        let store = PostgresScanStore::new(pool.clone());
        store.migrate().await.expect("run migrations");

        sqlx::query("TRUNCATE workspaces CASCADE")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("TRUNCATE worker_nodes")
            .execute(&pool)
            .await
            .unwrap();

        (pool, Arc::new(store))
    }

    /// Workspace + scan driven to `scanning`.
    async fn scanning_scan(store: &PostgresScanStore) -> Scan {
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        let scan = store
            .create_scan(&NewScan::new(ws.id, "nightly"))
            .await
            .unwrap();
        let now = Utc::now();
        store.start_scan(scan.id, now).await.unwrap().unwrap();
        store.begin_scanning(scan.id, now).await.unwrap().unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_scan_round_trip() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();

        let mut new_scan = NewScan::new(ws.id, "nightly");
        new_scan.max_concurrent_jobs = Some(4);
        new_scan.isolated = true;
        let scan = store.create_scan(&new_scan).await.unwrap();

        let loaded = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "nightly");
        assert_eq!(loaded.status, ScanStatus::Pending);
        assert_eq!(loaded.phase, ScanPhase::Crawl);
        assert_eq!(loaded.max_concurrent_jobs, Some(4));
        assert!(loaded.isolated);
        assert!(loaded.previous_status.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_pause_restores_previous_status() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let now = Utc::now();

        let paused = store.pause_scan(scan.id, now).await.unwrap().unwrap();
        assert_eq!(paused.status, ScanStatus::Paused);
        assert_eq!(paused.previous_status, Some(ScanStatus::Scanning));
        assert!(paused.paused_at.is_some());

        // Pausing again refuses.
        assert!(store.pause_scan(scan.id, now).await.unwrap().is_none());

        let resumed = store.resume_scan(scan.id, now).await.unwrap().unwrap();
        assert_eq!(resumed.status, ScanStatus::Scanning);
        assert!(resumed.previous_status.is_none());
        assert!(resumed.paused_at.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_contention() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;

        let jobs: Vec<NewScanJob> = (0..12)
            .map(|_| NewScanJob::new(scan.id, JobType::ActiveScan))
            .collect();
        store.insert_jobs(&jobs).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                let wid = format!("node-{worker}");
                let mut claimed = Vec::new();
                while let Some(job) = s.claim_next(&wid, Utc::now()).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }

        // Every job claimed exactly once, none left pending.
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 12);
        assert_eq!(store.pending_job_count(scan.id).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_ordering_priority_then_age() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;

        let low = store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery))
            .await
            .unwrap();
        let high = store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery).with_priority(10))
            .await
            .unwrap();
        let mid = store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery).with_priority(5))
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim_next("w", now).await.unwrap().unwrap();
        let second = store.claim_next("w", now).await.unwrap().unwrap();
        let third = store.claim_next("w", now).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, mid.id);
        assert_eq!(third.id, low.id);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_skips_paused_scan() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery))
            .await
            .unwrap();

        store.pause_scan(scan.id, Utc::now()).await.unwrap().unwrap();
        assert!(store.claim_next("w", Utc::now()).await.unwrap().is_none());

        store.resume_scan(scan.id, Utc::now()).await.unwrap().unwrap();
        assert!(store.claim_next("w", Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_isolated_scan_needs_scoped_claim() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        let mut new_scan = NewScan::new(ws.id, "isolated");
        new_scan.isolated = true;
        let scan = store.create_scan(&new_scan).await.unwrap();
        let now = Utc::now();
        store.start_scan(scan.id, now).await.unwrap().unwrap();
        store.begin_scanning(scan.id, now).await.unwrap().unwrap();
        store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery))
            .await
            .unwrap();

        // Generic claim never serves an isolated scan.
        assert!(store.claim_next("w1", now).await.unwrap().is_none());
        // The scoped claim does.
        let job = store
            .claim_next_for_scan("w1", scan.id, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_respects_concurrency_cap() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        let mut new_scan = NewScan::new(ws.id, "capped");
        new_scan.max_concurrent_jobs = Some(2);
        let scan = store.create_scan(&new_scan).await.unwrap();
        let now = Utc::now();
        store.start_scan(scan.id, now).await.unwrap().unwrap();
        store.begin_scanning(scan.id, now).await.unwrap().unwrap();

        let jobs: Vec<NewScanJob> = (0..4)
            .map(|_| NewScanJob::new(scan.id, JobType::ActiveScan))
            .collect();
        store.insert_jobs(&jobs).await.unwrap();

        assert!(store.claim_next("w1", now).await.unwrap().is_some());
        assert!(store.claim_next("w2", now).await.unwrap().is_some());
        // Cap reached: two in flight.
        assert!(store.claim_next("w3", now).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_respects_throttle() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        store
            .insert_job(&NewScanJob::new(scan.id, JobType::Discovery))
            .await
            .unwrap();

        let now = Utc::now();
        store
            .set_scan_throttled_until(scan.id, Some(now + Duration::minutes(5)))
            .await
            .unwrap();
        assert!(store.claim_next("w", now).await.unwrap().is_none());

        // Past the deadline the claim succeeds again.
        assert!(store
            .claim_next("w", now + Duration::minutes(6))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_mark_failed_requeues_until_max_attempts() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let mut new_job = NewScanJob::new(scan.id, JobType::Discovery);
        new_job.max_attempts = 2;
        let job = store.insert_job(&new_job).await.unwrap();

        let now = Utc::now();
        store.claim_next("w", now).await.unwrap().unwrap();
        store.mark_job_running(job.id, now).await.unwrap().unwrap();
        let failed = store
            .mark_job_failed(job.id, "connection_error", "boom", now)
            .await
            .unwrap()
            .unwrap();
        // First failure re-arms.
        assert_eq!(failed.status, JobStatus::Pending);
        assert!(failed.worker_id.is_none());
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error_type.as_deref(), Some("connection_error"));

        store.claim_next("w", now).await.unwrap().unwrap();
        store.mark_job_running(job.id, now).await.unwrap().unwrap();
        let failed = store
            .mark_job_failed(job.id, "connection_error", "boom again", now)
            .await
            .unwrap()
            .unwrap();
        // attempts == max_attempts: terminal.
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.completed_at.is_some());
        assert!(store.claim_next("w", now).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_timeout_is_terminal() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let mut new_job = NewScanJob::new(scan.id, JobType::Discovery);
        new_job.max_duration_ms = Some(1_000);
        let job = store.insert_job(&new_job).await.unwrap();

        let now = Utc::now();
        store.claim_next("w", now).await.unwrap().unwrap();
        store.mark_job_running(job.id, now).await.unwrap().unwrap();

        let (failed, scan_ids) = store
            .reset_timed_out(now + Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(failed, 1);
        assert_eq!(scan_ids, vec![scan.id]);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_type.as_deref(), Some("timeout"));
        assert_eq!(job.attempts, 1);

        // No retry for timed-out jobs.
        assert!(store
            .claim_next("w", now + Duration::seconds(4))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_release_by_worker_node() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let jobs: Vec<NewScanJob> = (0..4)
            .map(|_| NewScanJob::new(scan.id, JobType::ActiveScan))
            .collect();
        store.insert_jobs(&jobs).await.unwrap();

        let now = Utc::now();
        store.claim_next("host-7-0", now).await.unwrap().unwrap();
        store.claim_next("host-7-1", now).await.unwrap().unwrap();
        let other = store.claim_next("host-8-0", now).await.unwrap().unwrap();

        let released = store.release_by_worker_node("host-7").await.unwrap();
        assert_eq!(released, 2);

        let stats = store.job_stats(scan.id).await.unwrap();
        assert_eq!(stats.get(&JobStatus::Pending).copied().unwrap_or(0), 3);
        // The other node's claim is untouched.
        let other = store.get_job(other.id).await.unwrap().unwrap();
        assert_eq!(other.status, JobStatus::Claimed);
        assert_eq!(other.worker_id.as_deref(), Some("host-8-0"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_stale_node_cleanup() {
        let (_pool, store) = setup().await;
        let registered_at = Utc::now() - Duration::minutes(10);
        store
            .register_node(
                &NewWorkerNode {
                    id: "host-9".into(),
                    hostname: "host".into(),
                    worker_count: 2,
                    version: Some("1.0.0".into()),
                },
                registered_at,
            )
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::minutes(2);
        let stale = store.stale_nodes(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);

        let stopped = store.mark_stale_nodes_stopped(cutoff).await.unwrap();
        assert_eq!(stopped, vec!["host-9".to_string()]);
        let node = store.get_node("host-9").await.unwrap().unwrap();
        assert_eq!(node.status, WorkerNodeStatus::Stopped);

        // Re-registration resurrects the node with fresh counters.
        let node = store
            .register_node(
                &NewWorkerNode {
                    id: "host-9".into(),
                    hostname: "host".into(),
                    worker_count: 4,
                    version: Some("1.0.1".into()),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(node.status, WorkerNodeStatus::Running);
        assert_eq!(node.worker_count, 4);
        assert_eq!(node.jobs_claimed, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_phase_cas_exclusive() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let s = store.clone();
            let id = scan.id;
            handles.push(tokio::spawn(async move {
                s.compare_and_swap_phase(id, ScanPhase::Crawl, ScanPhase::Fingerprint)
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.phase, ScanPhase::Fingerprint);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_update_counts() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let jobs: Vec<NewScanJob> = (0..5)
            .map(|_| NewScanJob::new(scan.id, JobType::Discovery))
            .collect();
        store.insert_jobs(&jobs).await.unwrap();

        let now = Utc::now();
        // One left claimed, one running, one completed, two untouched.
        store.claim_next("w", now).await.unwrap().unwrap();
        let running = store.claim_next("w", now).await.unwrap().unwrap();
        store.mark_job_running(running.id, now).await.unwrap().unwrap();
        let done = store.claim_next("w", now).await.unwrap().unwrap();
        store.mark_job_running(done.id, now).await.unwrap().unwrap();
        store.mark_job_completed(done.id, 3, now).await.unwrap().unwrap();

        let scan = store.update_scan_counts(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.jobs_total, 5);
        assert_eq!(scan.jobs_completed, 1);
        // One claimed + one running.
        assert_eq!(scan.jobs_running, 2);
        assert_eq!(scan.jobs_pending, 2);
        assert_eq!(scan.jobs_failed, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_oob_coalescing() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        let test = store
            .insert_oob_test(&NewOobTest {
                workspace_id: ws.id,
                scan_id: None,
                scan_job_id: None,
                history_id: None,
                code: "blind_ssrf".into(),
                test_name: "ssrf probe".into(),
                target: "https://example.com/api".into(),
                interaction_full_id: "ABC.oob.example.com".into(),
                interaction_domain: "oob.example.com".into(),
                payload: b"http://abc.oob.example.com/".to_vec(),
                insertion_point: Some("url".into()),
            })
            .await
            .unwrap();
        // Stored lowercased.
        assert_eq!(test.interaction_full_id, "abc.oob.example.com");

        let base = Utc::now();
        let make = |protocol: &str, full_id: &str, offset_ms: i64| NewOobInteraction {
            protocol: protocol.into(),
            full_id: full_id.into(),
            qtype: Some("A".into()),
            raw_request: Some("query".into()),
            raw_response: None,
            remote_address: Some("198.51.100.7".into()),
            timestamp: base + Duration::milliseconds(offset_ms),
        };

        // Three spellings of the same identifier.
        let first = store
            .correlate_oob_interaction("abc.oob.example.com", &make("dns", "ABC.oob.example.com", 0))
            .await
            .unwrap();
        let CorrelationOutcome::Promoted { issue_id } = first else {
            panic!("expected promotion, got {first:?}");
        };

        let second = store
            .correlate_oob_interaction(
                "abc.oob.example.com",
                &make("dns", "dns://abc.oob.example.com", 10),
            )
            .await
            .unwrap();
        assert_eq!(second, CorrelationOutcome::Appended { issue_id });

        let third = store
            .correlate_oob_interaction("abc.oob.example.com", &make("http", "abc.oob.example.com", 20))
            .await
            .unwrap();
        assert_eq!(third, CorrelationOutcome::Appended { issue_id });

        // One issue, three interactions, rendered in timestamp order.
        let issue = store.get_issue(issue_id).await.unwrap().unwrap();
        assert!(issue.details.contains("Received 3 interaction(s)"));
        assert_eq!(issue.confidence, 80);
        let interactions = store.interactions_for_issue(issue_id).await.unwrap();
        assert_eq!(interactions.len(), 3);
        assert!(interactions.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let test = store.get_oob_test(test.id).await.unwrap().unwrap();
        assert_eq!(test.issue_id, Some(issue_id));

        // Unknown identifier: dropped.
        let miss = store
            .correlate_oob_interaction("nope.oob.example.com", &make("dns", "nope", 30))
            .await
            .unwrap();
        assert_eq!(miss, CorrelationOutcome::NoMatch);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_browser_event_dedup() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        let event = NewBrowserEvent {
            workspace_id: ws.id,
            scan_id: None,
            event_type: "console.log".into(),
            category: "console".into(),
            url: "https://example.com/app".into(),
            data: serde_json::json!({"message": "hello"}),
        };
        let hash = crate::events::compute_hash(&event.event_type, &event.url, &event.data);

        let t0 = Utc::now();
        for i in 0..5 {
            store
                .upsert_browser_event(&hash, &event, t0 + Duration::milliseconds(i * 10))
                .await
                .unwrap();
        }

        let row = store
            .find_browser_event(&hash, ws.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.occurrence_count, 5);
        assert!(row.first_seen_at < row.last_seen_at);

        // A variant with one data field changed is a separate row.
        let variant = NewBrowserEvent {
            data: serde_json::json!({"message": "bye"}),
            ..event.clone()
        };
        let variant_hash =
            crate::events::compute_hash(&variant.event_type, &variant.url, &variant.data);
        let row = store
            .upsert_browser_event(&variant_hash, &variant, t0)
            .await
            .unwrap();
        assert_eq!(row.occurrence_count, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_proxy_port_unique() {
        let (_pool, store) = setup().await;
        let ws = store.create_workspace("acme", "Acme Corp").await.unwrap();
        store.create_proxy_service(ws.id, "intercept", 8080).await.unwrap();

        let err = store
            .create_proxy_service(ws.id, "intercept-2", 8080)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)), "got {err:?}");
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_site_behavior_upsert() {
        let (_pool, store) = setup().await;
        let scan = scanning_scan(&store).await;
        let now = Utc::now();

        let fp = BehaviorFingerprint {
            status_code: 404,
            response_hash: "aa".into(),
            content_type: Some("text/html".into()),
            body_size: 1234,
        };
        let row = store
            .upsert_site_behavior(scan.id, "https://example.com", &fp, now)
            .await
            .unwrap();
        assert_eq!(row.fingerprint.status_code, 404);

        let fp2 = BehaviorFingerprint {
            status_code: 200,
            response_hash: "bb".into(),
            content_type: Some("text/html".into()),
            body_size: 99,
        };
        let row2 = store
            .upsert_site_behavior(scan.id, "https://example.com", &fp2, now + Duration::seconds(1))
            .await
            .unwrap();
        // Same row, overwritten fingerprint.
        assert_eq!(row2.id, row.id);
        assert_eq!(row2.fingerprint.status_code, 200);
        assert!(row2.updated_at > row2.created_at);
    }
}
