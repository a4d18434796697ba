//! Worker node registry.
//!
//! Nodes upsert themselves at startup, heartbeat while alive, and are
//! detected as stale once `last_seen_at` falls behind the threshold. Job
//! ownership is encoded in the worker id: `[prefix-]hostname-pid` for the
//! node, with `-<slot>` appended per worker, so a dead node's jobs are
//! recoverable with a single prefix match.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::ScanStore;
use crate::types::{NewWorkerNode, NodeCounter, WorkerNode, WorkerNodeStatus};

/// Hostname of this machine, or a placeholder when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// `[prefix-]hostname-pid` for this process.
pub fn local_node_id(prefix: Option<&str>) -> String {
    let host = local_hostname();
    let pid = std::process::id();
    match prefix {
        Some(p) => format!("{p}-{host}-{pid}"),
        None => format!("{host}-{pid}"),
    }
}

/// Worker id for one slot of a node.
pub fn worker_id(node_id: &str, slot: usize) -> String {
    format!("{node_id}-{slot}")
}

pub struct WorkerRegistry {
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn ScanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Upsert by id: status running, fresh timestamps, counters reset.
    pub async fn register(&self, node: &NewWorkerNode) -> Result<WorkerNode> {
        let registered = self.store.register_node(node, self.clock.now()).await?;
        info!(node_id = %registered.id, workers = registered.worker_count, "worker node registered");
        Ok(registered)
    }

    pub async fn heartbeat(&self, id: &str) -> Result<bool> {
        self.store.heartbeat_node(id, self.clock.now()).await
    }

    /// Counter bumps are best-effort: a storage hiccup is logged and
    /// swallowed so the worker keeps going.
    pub async fn increment_claimed(&self, id: &str) {
        self.bump(id, NodeCounter::Claimed).await;
    }

    pub async fn increment_completed(&self, id: &str) {
        self.bump(id, NodeCounter::Completed).await;
    }

    pub async fn increment_failed(&self, id: &str) {
        self.bump(id, NodeCounter::Failed).await;
    }

    async fn bump(&self, id: &str, counter: NodeCounter) {
        if let Err(e) = self
            .store
            .bump_node_counter(id, counter, self.clock.now())
            .await
        {
            warn!(node_id = %id, ?counter, error = %e, "failed to bump node counter");
        }
    }

    pub async fn set_status(&self, id: &str, status: WorkerNodeStatus) -> Result<bool> {
        self.store.set_node_status(id, status).await
    }

    pub async fn deregister(&self, id: &str) -> Result<bool> {
        self.store.deregister_node(id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkerNode>> {
        self.store.get_node(id).await
    }

    /// Running nodes seen within `threshold`.
    pub async fn active_nodes(&self, threshold: Duration) -> Result<Vec<WorkerNode>> {
        self.store.active_nodes(self.clock.now() - threshold).await
    }

    /// Running nodes NOT seen within `threshold`.
    pub async fn stale_nodes(&self, threshold: Duration) -> Result<Vec<WorkerNode>> {
        self.store.stale_nodes(self.clock.now() - threshold).await
    }

    /// Mark stale nodes stopped; returns their ids.
    pub async fn cleanup_stale(&self, threshold: Duration) -> Result<Vec<String>> {
        let stopped = self
            .store
            .mark_stale_nodes_stopped(self.clock.now() - threshold)
            .await?;
        for id in &stopped {
            warn!(node_id = %id, "stale worker node marked stopped");
        }
        Ok(stopped)
    }

    /// Dead-node recovery in one call: mark stale nodes stopped, then
    /// release every in-flight job owned by their workers. Returns the
    /// stopped node ids and the number of jobs released.
    pub async fn reset_jobs_from_stale_workers(
        &self,
        threshold: Duration,
    ) -> Result<(Vec<String>, u64)> {
        let stopped = self.cleanup_stale(threshold).await?;
        let mut released = 0;
        for node_id in &stopped {
            released += self.store.release_by_worker_node(node_id).await?;
        }
        if released > 0 {
            info!(nodes = stopped.len(), released, "recovered jobs from stale workers");
        }
        Ok((stopped, released))
    }

    /// Garbage-collect stopped nodes last seen before `retention` ago.
    pub async fn delete_old(&self, retention: Duration) -> Result<u64> {
        self.store
            .delete_stopped_nodes(self.clock.now() - retention)
            .await
    }
}
