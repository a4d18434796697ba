//! Domain entities and status machines.
//!
//! Statuses are stored as text; every enum carries `as_str` plus `FromStr`
//! so rows round-trip through the stores without a Postgres enum type.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

// ─── Scan status ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Crawling,
    Scanning,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Crawling => "crawling",
            Self::Scanning => "scanning",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Statuses whose jobs are eligible for `claim_next`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Crawling | Self::Scanning)
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScanStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "crawling" => Ok(Self::Crawling),
            "scanning" => Ok(Self::Scanning),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::unknown("scan status", s)),
        }
    }
}

// ─── Scan phase ───────────────────────────────────────────────

/// Linear phase progression within a scan. Advancing is only permitted via
/// the compare-and-swap in `ScanLifecycle::atomic_set_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Crawl,
    Fingerprint,
    SiteBehavior,
    ApiBehavior,
    Discovery,
    Nuclei,
    ActiveScan,
    Websocket,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Fingerprint => "fingerprint",
            Self::SiteBehavior => "site_behavior",
            Self::ApiBehavior => "api_behavior",
            Self::Discovery => "discovery",
            Self::Nuclei => "nuclei",
            Self::ActiveScan => "active_scan",
            Self::Websocket => "websocket",
        }
    }

    /// The phase that follows this one, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Crawl => Some(Self::Fingerprint),
            Self::Fingerprint => Some(Self::SiteBehavior),
            Self::SiteBehavior => Some(Self::ApiBehavior),
            Self::ApiBehavior => Some(Self::Discovery),
            Self::Discovery => Some(Self::Nuclei),
            Self::Nuclei => Some(Self::ActiveScan),
            Self::ActiveScan => Some(Self::Websocket),
            Self::Websocket => None,
        }
    }
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScanPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawl" => Ok(Self::Crawl),
            "fingerprint" => Ok(Self::Fingerprint),
            "site_behavior" => Ok(Self::SiteBehavior),
            "api_behavior" => Ok(Self::ApiBehavior),
            "discovery" => Ok(Self::Discovery),
            "nuclei" => Ok(Self::Nuclei),
            "active_scan" => Ok(Self::ActiveScan),
            "websocket" => Ok(Self::Websocket),
            _ => Err(Error::unknown("scan phase", s)),
        }
    }
}

// ─── Job status / type ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Claimed or running: owned by a worker right now.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::unknown("job status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Crawl,
    ActiveScan,
    WebsocketScan,
    Discovery,
    Nuclei,
    SiteBehavior,
    ApiBehavior,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::ActiveScan => "active_scan",
            Self::WebsocketScan => "websocket_scan",
            Self::Discovery => "discovery",
            Self::Nuclei => "nuclei",
            Self::SiteBehavior => "site_behavior",
            Self::ApiBehavior => "api_behavior",
        }
    }

    /// Deadline applied at enqueue when the caller does not set one.
    pub fn default_max_duration(&self) -> Duration {
        match self {
            Self::Crawl => Duration::hours(1),
            Self::ActiveScan => Duration::minutes(30),
            Self::WebsocketScan => Duration::minutes(15),
            Self::Discovery => Duration::minutes(5),
            Self::Nuclei => Duration::minutes(20),
            Self::SiteBehavior => Duration::minutes(2),
            Self::ApiBehavior => Duration::minutes(2),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawl" => Ok(Self::Crawl),
            "active_scan" => Ok(Self::ActiveScan),
            "websocket_scan" => Ok(Self::WebsocketScan),
            "discovery" => Ok(Self::Discovery),
            "nuclei" => Ok(Self::Nuclei),
            "site_behavior" => Ok(Self::SiteBehavior),
            "api_behavior" => Ok(Self::ApiBehavior),
            _ => Err(Error::unknown("job type", s)),
        }
    }
}

// ─── Worker node status ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerNodeStatus {
    Running,
    Draining,
    Stopped,
}

impl WorkerNodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerNodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerNodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "draining" => Ok(Self::Draining),
            "stopped" => Ok(Self::Stopped),
            _ => Err(Error::unknown("worker node status", s)),
        }
    }
}

// ─── Severity / history source ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(Error::unknown("severity", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Crawler,
    Scanner,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Scanner => "scanner",
        }
    }
}

impl std::str::FromStr for HistorySource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawler" => Ok(Self::Crawler),
            "scanner" => Ok(Self::Scanner),
            _ => Err(Error::unknown("history source", s)),
        }
    }
}

// ─── Workspace ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ─── Scan ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub title: String,
    /// Opaque scan configuration; interpreted by the audit modules only.
    pub options: Value,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    /// Status to restore on resume. Set on pause, cleared on resume.
    pub previous_status: Option<ScanStatus>,
    pub max_rps: Option<i32>,
    /// NULL means unbounded concurrency for this scan.
    pub max_concurrent_jobs: Option<i32>,
    pub consecutive_failures: i32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub throttled_until: Option<DateTime<Utc>>,
    pub jobs_total: i64,
    pub jobs_pending: i64,
    pub jobs_running: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque scan-level checkpoint blob (see `checkpoint::ScanCheckpoint`).
    pub checkpoint: Option<Value>,
    pub isolated: bool,
    pub capture_browser_events: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a scan.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub workspace_id: Uuid,
    pub title: String,
    pub options: Value,
    pub max_rps: Option<i32>,
    pub max_concurrent_jobs: Option<i32>,
    pub isolated: bool,
    pub capture_browser_events: bool,
}

impl NewScan {
    pub fn new(workspace_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            workspace_id,
            title: title.into(),
            options: Value::Object(Default::default()),
            max_rps: None,
            max_concurrent_jobs: None,
            isolated: false,
            capture_browser_events: false,
        }
    }
}

// ─── ScanJob ──────────────────────────────────────────────────

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub status: JobStatus,
    pub job_type: JobType,
    pub priority: i32,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution starts; incremented by `mark_running`.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Deadline relative to `started_at`, in milliseconds.
    pub max_duration_ms: i64,
    pub target_host: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub history_id: Option<Uuid>,
    pub websocket_connection_id: Option<Uuid>,
    pub api_definition_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub issues_found: i32,
    /// Opaque job-level checkpoint blob (see `checkpoint::JobCheckpoint`).
    pub checkpoint: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ScanJob {
    /// Deadline for this attempt, if it has started.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|s| s + Duration::milliseconds(self.max_duration_ms))
    }
}

/// Insert payload for a job. `max_duration` defaults by job type at enqueue.
#[derive(Debug, Clone)]
pub struct NewScanJob {
    pub scan_id: Uuid,
    pub job_type: JobType,
    pub priority: i32,
    pub max_attempts: i32,
    pub max_duration_ms: Option<i64>,
    pub target_host: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub history_id: Option<Uuid>,
    pub websocket_connection_id: Option<Uuid>,
    pub api_definition_id: Option<Uuid>,
    pub payload: Option<Value>,
}

impl NewScanJob {
    pub fn new(scan_id: Uuid, job_type: JobType) -> Self {
        Self {
            scan_id,
            job_type,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_duration_ms: None,
            target_host: None,
            url: None,
            method: None,
            history_id: None,
            websocket_connection_id: None,
            api_definition_id: None,
            payload: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Optional narrowing for bulk job cancellation.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
}

// ─── WorkerNode ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    /// `[prefix-]hostname-pid`. Worker slots append `-<n>`; the prefix match
    /// in `release_by_worker_node` depends on this shape.
    pub id: String,
    pub hostname: String,
    pub worker_count: i32,
    pub status: WorkerNodeStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub jobs_claimed: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub version: Option<String>,
}

/// Registration payload for a worker node.
#[derive(Debug, Clone)]
pub struct NewWorkerNode {
    pub id: String,
    pub hostname: String,
    pub worker_count: i32,
    pub version: Option<String>,
}

/// Which per-node counter an increment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCounter {
    Claimed,
    Completed,
    Failed,
}

// ─── OOB test / interaction ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobTest {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub scan_job_id: Option<Uuid>,
    pub history_id: Option<Uuid>,
    /// Issue template code (e.g. `blind_ssrf`).
    pub code: String,
    pub test_name: String,
    pub target: String,
    /// Lowercased unique identifier echoed back by callbacks.
    pub interaction_full_id: String,
    pub interaction_domain: String,
    /// Injected payload; base64 with a trailing note when the original
    /// bytes were not valid UTF-8.
    pub payload: Option<String>,
    pub insertion_point: Option<String>,
    /// Set once the first matching interaction promotes this test.
    pub issue_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOobTest {
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub scan_job_id: Option<Uuid>,
    pub history_id: Option<Uuid>,
    pub code: String,
    pub test_name: String,
    pub target: String,
    pub interaction_full_id: String,
    pub interaction_domain: String,
    pub payload: Vec<u8>,
    pub insertion_point: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobInteraction {
    pub id: Uuid,
    pub oob_test_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
    pub protocol: String,
    pub full_id: String,
    pub qtype: Option<String>,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    pub remote_address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound callback as delivered by the OOB listener.
#[derive(Debug, Clone)]
pub struct NewOobInteraction {
    pub protocol: String,
    pub full_id: String,
    pub qtype: Option<String>,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    pub remote_address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of correlating one inbound interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// No test carries this identifier; the interaction was dropped.
    NoMatch,
    /// First interaction for the test; a new issue was created.
    Promoted { issue_id: Uuid },
    /// Appended to the issue created by an earlier interaction.
    Appended { issue_id: Uuid },
}

// ─── Issue ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub code: String,
    pub title: String,
    pub description: String,
    /// Rendered interaction log, rebuilt on every append.
    pub details: String,
    pub severity: Severity,
    pub confidence: i32,
    pub url: Option<String>,
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── BrowserEvent ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub event_type: String,
    pub category: String,
    pub url: String,
    pub data: Value,
    /// hex(sha256(event_type | url | canonical_json(data)))
    pub content_hash: String,
    pub occurrence_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBrowserEvent {
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub event_type: String,
    pub category: String,
    pub url: String,
    pub data: Value,
}

// ─── History / WebSocket connection (minimal) ─────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub url: String,
    pub method: String,
    pub status_code: Option<i32>,
    pub source: HistorySource,
    pub raw_request: Option<Vec<u8>>,
    pub raw_response: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub url: String,
    pub method: String,
    pub status_code: Option<i32>,
    pub source: HistorySource,
    pub raw_request: Option<Vec<u8>>,
    pub raw_response: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConnection {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scan_id: Option<Uuid>,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

// ─── API definitions / behavior fingerprints ──────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub source_url: Option<String>,
    pub schema: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: Uuid,
    pub api_definition_id: Uuid,
    pub path: String,
    pub method: String,
    pub parameters: Value,
}

/// One schema-driven probing session: a scan working through an API
/// definition's endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiScan {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub api_definition_id: Uuid,
    pub status: String,
    pub endpoints_probed: i32,
    pub created_at: DateTime<Utc>,
}

/// Response class an audit fingerprints to suppress false positives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorClass {
    NotFound,
    Unauthenticated,
    MalformedBody,
}

impl BehaviorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::MalformedBody => "malformed_body",
        }
    }
}

impl std::str::FromStr for BehaviorClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(Self::NotFound),
            "unauthenticated" => Ok(Self::Unauthenticated),
            "malformed_body" => Ok(Self::MalformedBody),
            _ => Err(Error::unknown("behavior class", s)),
        }
    }
}

/// Baseline response fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorFingerprint {
    pub status_code: i32,
    pub response_hash: String,
    pub content_type: Option<String>,
    pub body_size: i64,
}

/// Per-base-URL 404-behavior baseline for a scan. Unique on
/// `(scan_id, base_url)`; re-observation overwrites the fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteBehaviorResult {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub base_url: String,
    pub fingerprint: BehaviorFingerprint,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiBehaviorResult {
    pub id: Uuid,
    pub scan_id: Option<Uuid>,
    pub api_definition_id: Uuid,
    pub behavior_class: BehaviorClass,
    pub fingerprint: BehaviorFingerprint,
    pub created_at: DateTime<Utc>,
}

// ─── ProxyService ─────────────────────────────────────────────

/// Carries the unique `port` constraint; violations surface to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyService {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub port: i32,
    pub created_at: DateTime<Utc>,
}
