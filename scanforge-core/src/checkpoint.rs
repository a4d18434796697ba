//! Durable progress markers.
//!
//! Checkpoints travel as opaque JSONB between the orchestrator and the
//! store; only the owning module interprets the blob, so adding a field is
//! a serde default rather than a schema migration. Writes are
//! last-writer-wins per row. Callers write at safe points (after a payload
//! batch or a finished audit module): after a crash, work before the last
//! checkpoint is not repeated and work after it is repeated at most once.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{BehaviorFingerprint, ScanPhase};

// ─── Scan-level checkpoint ────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlProgress {
    #[serde(default)]
    pub visited_urls: BTreeSet<String>,
    #[serde(default)]
    pub pending_urls: Vec<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub page_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    /// Phase the scan was executing when the checkpoint was written.
    #[serde(default)]
    pub phase: Option<ScanPhase>,
    #[serde(default)]
    pub completed_phases: Vec<ScanPhase>,
    #[serde(default)]
    pub crawl: CrawlProgress,
    /// History rows already fingerprinted.
    #[serde(default)]
    pub processed_history_ids: Vec<Uuid>,
    #[serde(default)]
    pub completed_discovery_urls: Vec<String>,
    #[serde(default)]
    pub nuclei_completed: bool,
    #[serde(default)]
    pub fingerprint_tags: Vec<String>,
    #[serde(default)]
    pub fingerprint_results: Option<Value>,
    #[serde(default)]
    pub scope_domains: Vec<String>,
    /// 404-behavior baseline per base URL.
    #[serde(default)]
    pub site_behavior: BTreeMap<String, BehaviorFingerprint>,
}

impl ScanCheckpoint {
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn mark_phase_completed(&mut self, phase: ScanPhase) {
        if !self.completed_phases.contains(&phase) {
            self.completed_phases.push(phase);
        }
    }

    pub fn is_phase_completed(&self, phase: ScanPhase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// First phase not yet recorded as completed. Restart recovery enqueues
    /// work for this phase.
    pub fn next_phase(&self) -> ScanPhase {
        let mut phase = ScanPhase::Crawl;
        loop {
            if !self.is_phase_completed(phase) {
                return phase;
            }
            match phase.next() {
                Some(next) => phase = next,
                None => return phase,
            }
        }
    }
}

// ─── Job-level checkpoint ─────────────────────────────────────

/// Where a resumed worker picks up inside an audit job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePosition {
    pub audit: String,
    pub insertion_point_idx: u32,
    /// First payload index not yet covered by the checkpoint.
    pub next_payload_index: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Audit modules fully finished; skipped on resume.
    #[serde(default)]
    pub completed_audits: Vec<String>,
    #[serde(default)]
    pub current_audit: Option<String>,
    #[serde(default)]
    pub current_insertion_point_idx: u32,
    #[serde(default)]
    pub last_payload_index: Option<u64>,
    /// WebSocket jobs: messages already replayed.
    #[serde(default)]
    pub messages_processed: u64,
}

impl JobCheckpoint {
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_audit_completed(&self, audit: &str) -> bool {
        self.completed_audits.iter().any(|a| a == audit)
    }

    pub fn mark_audit_completed(&mut self, audit: impl Into<String>) {
        let audit = audit.into();
        if !self.is_audit_completed(&audit) {
            self.completed_audits.push(audit);
        }
        self.current_audit = None;
        self.current_insertion_point_idx = 0;
        self.last_payload_index = None;
    }

    /// Resume at `(current_audit, current_insertion_point_idx,
    /// last_payload_index + 1)`; `None` when no audit was in flight.
    pub fn resume_position(&self) -> Option<ResumePosition> {
        self.current_audit.as_ref().map(|audit| ResumePosition {
            audit: audit.clone(),
            insertion_point_idx: self.current_insertion_point_idx,
            next_payload_index: self.last_payload_index.map(|i| i + 1).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scan_checkpoint_round_trip() {
        let mut cp = ScanCheckpoint::default();
        cp.phase = Some(ScanPhase::Crawl);
        cp.crawl.visited_urls.insert("https://example.com/".into());
        cp.crawl.pending_urls.push("https://example.com/a".into());
        cp.crawl.depth = 2;
        cp.mark_phase_completed(ScanPhase::Crawl);

        let blob = cp.to_json().unwrap();
        let back = ScanCheckpoint::from_json(&blob).unwrap();
        assert!(back.is_phase_completed(ScanPhase::Crawl));
        assert_eq!(back.crawl.visited_urls.len(), 1);
        assert_eq!(back.next_phase(), ScanPhase::Fingerprint);
    }

    #[test]
    fn partial_blob_deserializes_with_defaults() {
        let blob = json!({ "nuclei_completed": true });
        let cp = ScanCheckpoint::from_json(&blob).unwrap();
        assert!(cp.nuclei_completed);
        assert!(cp.completed_phases.is_empty());
        assert_eq!(cp.next_phase(), ScanPhase::Crawl);
    }

    #[test]
    fn mark_phase_completed_is_idempotent() {
        let mut cp = ScanCheckpoint::default();
        cp.mark_phase_completed(ScanPhase::Discovery);
        cp.mark_phase_completed(ScanPhase::Discovery);
        assert_eq!(cp.completed_phases.len(), 1);
    }

    #[test]
    fn resume_skips_completed_audits_and_advances_payload() {
        let mut cp = JobCheckpoint::default();
        assert!(cp.resume_position().is_none());

        cp.current_audit = Some("sql_injection".into());
        cp.current_insertion_point_idx = 3;
        cp.last_payload_index = Some(17);

        let pos = cp.resume_position().unwrap();
        assert_eq!(pos.audit, "sql_injection");
        assert_eq!(pos.insertion_point_idx, 3);
        assert_eq!(pos.next_payload_index, 18);

        cp.mark_audit_completed("sql_injection");
        assert!(cp.is_audit_completed("sql_injection"));
        assert!(cp.resume_position().is_none());
    }

    #[test]
    fn fresh_audit_resumes_at_payload_zero() {
        let cp = JobCheckpoint {
            current_audit: Some("xss".into()),
            ..Default::default()
        };
        assert_eq!(cp.resume_position().unwrap().next_payload_index, 0);
    }
}
