//! Browser-event aggregation.
//!
//! The hijack pipeline emits a stream of captured events with heavy
//! repetition; rows are deduplicated by a content hash over the fields that
//! identify an event, and repeats only bump a counter and a timestamp.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use serde_json::Value;
use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::ScanStore;
use crate::types::{BrowserEvent, NewBrowserEvent};

/// hex(sha256(event_type | "|" | url | "|" | canonical_json(data))).
///
/// serde_json object keys serialize in sorted order at every level, so the
/// serialization is canonical: the hash is a pure function of the event's
/// content, not of field arrival order.
pub fn compute_hash(event_type: &str, url: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(data.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Disposition counts for a batch ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: usize,
    pub failed: usize,
}

pub struct EventAggregator {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl EventAggregator {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Upsert one event: an existing row scoped to (hash, workspace, scan)
    /// gets `occurrence_count += 1` and a fresh `last_seen_at`; otherwise a
    /// new row is inserted with count 1.
    pub async fn save(&self, event: &NewBrowserEvent) -> Result<BrowserEvent> {
        let hash = compute_hash(&event.event_type, &event.url, &event.data);
        self.store
            .upsert_browser_event(&hash, event, self.clock.now())
            .await
    }

    /// Sequential batch ingest. A failure on one item does not block the
    /// others.
    pub async fn save_batch(&self, events: &[NewBrowserEvent]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            match self.save(event).await {
                Ok(_) => outcome.saved += 1,
                Err(e) => {
                    warn!(
                        event_type = %event.event_type,
                        url = %event.url,
                        error = %e,
                        "failed to save browser event"
                    );
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}
