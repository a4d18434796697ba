//! Throughput and rollup read models.
//!
//! Derived entirely from completed-job timestamps and issue/history rows;
//! nothing here writes. The Postgres backend computes percentiles
//! server-side; `MemoryStore` computes them from the raw durations.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::ScanStore;
use crate::types::JobType;

// ─── Snapshot types ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThroughputSnapshot {
    pub completed_last_minute: i64,
    pub completed_last_5m: i64,
    pub completed_last_hour: i64,
    /// Derived from the 5-minute window.
    pub jobs_per_minute: f64,
    /// completed / (completed + failed) over the last hour; `None` when the
    /// window is empty.
    pub success_rate: Option<f64>,
    pub pending: i64,
    pub in_flight: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDurationStats {
    pub job_type: JobType,
    pub count: i64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestRollup {
    pub crawler: i64,
    pub scanner: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IssueRollup {
    pub unknown: i64,
    pub info: i64,
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub critical: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityRollup {
    pub requests: RequestRollup,
    pub issues: IssueRollup,
}

/// Percentile over a sorted slice, linear interpolation. `q` in [0, 1].
pub(crate) fn percentile(sorted_ms: &[i64], q: f64) -> f64 {
    match sorted_ms.len() {
        0 => 0.0,
        1 => sorted_ms[0] as f64,
        n => {
            let rank = q * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted_ms[lo] as f64 + (sorted_ms[hi] - sorted_ms[lo]) as f64 * frac
        }
    }
}

// ─── Components ───────────────────────────────────────────────

/// Windowed throughput and duration metrics.
pub struct ThroughputMeter {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl ThroughputMeter {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn snapshot(&self) -> Result<ThroughputSnapshot> {
        self.store.throughput_snapshot(self.clock.now()).await
    }

    /// Duration stats per job type over the last hour.
    pub async fn duration_stats(&self) -> Result<Vec<JobDurationStats>> {
        self.store.duration_stats(self.clock.now()).await
    }
}

/// Severity and source rollups per scan/workspace.
pub struct StatsRoller {
    store: Arc<dyn ScanStore>,
}

impl StatsRoller {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    pub async fn per_scan(&self, scan_id: Uuid) -> Result<ActivityRollup> {
        self.store.scan_rollup(scan_id).await
    }

    pub async fn per_workspace(&self, workspace_id: Uuid) -> Result<ActivityRollup> {
        self.store.workspace_rollup(workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let sorted = [100, 200, 300, 400, 500];
        assert_eq!(percentile(&sorted, 0.5), 300.0);
        assert_eq!(percentile(&sorted, 0.0), 100.0);
        assert_eq!(percentile(&sorted, 1.0), 500.0);
        assert_eq!(percentile(&sorted, 0.95), 480.0);
    }

    #[test]
    fn percentile_degenerate_inputs() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[42], 0.99), 42.0);
    }
}
