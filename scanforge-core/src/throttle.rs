//! Per-scan throttling.
//!
//! Two cooperating gates, both reconciled through `throttled_until` on the
//! Scan row so every orchestrator honors them, not just the one that
//! tripped: a circuit breaker fed by job outcomes, and a request-rate
//! limiter fed by `max_rps`. In-process state is an optimization only; the
//! row is the contract.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::ScanStore;

/// Consecutive failures before the breaker opens.
pub const TRIP_THRESHOLD: i32 = 5;
/// First backoff once open; doubles per further failure.
const BASE_BACKOFF_SECS: i64 = 60;
/// Backoff ceiling.
const MAX_BACKOFF_SECS: i64 = 900;

/// Backoff applied at a given failure streak. Zero below the threshold.
pub(crate) fn backoff_for(streak: i32) -> Duration {
    if streak < TRIP_THRESHOLD {
        return Duration::zero();
    }
    let exponent = (streak - TRIP_THRESHOLD).min(30) as u32;
    let secs = BASE_BACKOFF_SECS.saturating_mul(1_i64 << exponent);
    Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

pub struct CircuitBreaker {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a failed job. Once the streak reaches the trip threshold the
    /// scan is throttled; returns the throttle deadline when that happened.
    pub async fn record_failure(&self, scan_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let Some(streak) = self.store.bump_scan_failure(scan_id, now).await? else {
            return Ok(None);
        };

        let backoff = backoff_for(streak);
        if backoff.is_zero() {
            return Ok(None);
        }

        let until = now + backoff;
        self.store
            .set_scan_throttled_until(scan_id, Some(until))
            .await?;
        warn!(scan_id = %scan_id, streak, until = %until, "circuit breaker throttled scan");
        Ok(Some(until))
    }

    /// Record a successful job: streak and throttle both clear.
    pub async fn record_success(&self, scan_id: Uuid) -> Result<()> {
        self.store.reset_scan_failures(scan_id).await?;
        self.store.set_scan_throttled_until(scan_id, None).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    count: i32,
}

/// One-second-window request gate per scan.
pub struct RateLimiter {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<Uuid, Window>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Take one request slot for the scan. On an exhausted window the scan's
    /// `throttled_until` is pushed to the window boundary, so claimers in
    /// other processes back off too, and `false` is returned.
    pub async fn acquire(&self, scan_id: Uuid, max_rps: i32) -> Result<bool> {
        if max_rps <= 0 {
            return Ok(true);
        }

        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(scan_id).or_insert(Window { start: now, count: 0 });

        if now - window.start >= Duration::seconds(1) {
            window.start = now;
            window.count = 0;
        }

        if window.count < max_rps {
            window.count += 1;
            return Ok(true);
        }

        let until = window.start + Duration::seconds(1);
        drop(windows);
        self.store
            .set_scan_throttled_until(scan_id, Some(until))
            .await?;
        Ok(false)
    }
}
