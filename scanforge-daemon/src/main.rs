//! Supervisor daemon.
//!
//! Registers this host as a worker node, runs restart recovery, then keeps
//! the cluster healthy: heartbeats, the timeout sweeper, stale-claim
//! re-arming, dead-node recovery, and node garbage collection. Audit
//! workers are separate processes that link `scanforge-core` and run
//! `Worker` loops with their own handlers.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scanforge_core::clock::Clock;
use scanforge_core::lifecycle::ScanLifecycle;
use scanforge_core::queue::JobQueue;
use scanforge_core::registry::{self, WorkerRegistry};
use scanforge_core::types::{NewWorkerNode, WorkerNodeStatus};
use scanforge_core::{Config, PostgresScanStore, ScanStore, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let database_url =
        parse_database_url().context("set DATABASE_URL or pass --database-url <url>")?;
    let config = Config::from_env_with_dsn(database_url)?;

    info!("connecting to PostgreSQL");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.max_idle_conns)
        .max_connections(config.max_open_conns)
        .max_lifetime(config.conn_max_lifetime)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let store = PostgresScanStore::new(pool);
    store.migrate().await?;
    info!("migrations applied");

    let store: Arc<dyn ScanStore> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let node_id = registry::local_node_id(config.node_prefix.as_deref());
    let node_registry = WorkerRegistry::new(store.clone(), clock.clone());
    node_registry
        .register(&NewWorkerNode {
            id: node_id.clone(),
            hostname: registry::local_hostname(),
            worker_count: config.worker_count as i32,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
        .await?;

    let lifecycle = ScanLifecycle::new(store.clone(), clock.clone());
    let stale_claim = chrono::Duration::from_std(config.stale_claim_threshold)?;
    let report = lifecycle.recover(stale_claim).await?;
    info!(
        scans = report.scans_examined,
        stale_jobs_reset = report.stale_jobs_reset,
        jobs_enqueued = report.jobs_enqueued,
        "restart recovery finished"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = tokio::spawn(heartbeat_loop(
        WorkerRegistry::new(store.clone(), clock.clone()),
        node_id.clone(),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(sweeper_loop(
        store.clone(),
        clock.clone(),
        config.clone(),
        shutdown_rx,
    ));

    info!(node_id = %node_id, "scanforge daemon running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = heartbeat.await;
    let _ = sweeper.await;

    // Hand in-flight work back to the pool and mark this node stopped.
    let queue = JobQueue::new(store.clone(), clock.clone());
    match queue.release_by_worker_node(&node_id).await {
        Ok(released) => info!(released, "released in-flight jobs on shutdown"),
        Err(e) => warn!(error = %e, "failed to release in-flight jobs"),
    }
    if let Err(e) = node_registry
        .set_status(&node_id, WorkerNodeStatus::Stopped)
        .await
    {
        warn!(error = %e, "failed to mark node stopped");
    }

    Ok(())
}

async fn heartbeat_loop(
    registry: WorkerRegistry,
    node_id: String,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        match registry.heartbeat(&node_id).await {
            Ok(true) => {}
            Ok(false) => warn!(node_id = %node_id, "heartbeat target not registered"),
            // Best-effort: a storage hiccup must not take the daemon down.
            Err(e) => warn!(node_id = %node_id, error = %e, "heartbeat failed"),
        }
    }
}

async fn sweeper_loop(
    store: Arc<dyn ScanStore>,
    clock: Arc<dyn Clock>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = JobQueue::new(store.clone(), clock.clone());
    let registry = WorkerRegistry::new(store, clock);

    let stale_claim = chrono::Duration::from_std(config.stale_claim_threshold)
        .unwrap_or_else(|_| chrono::Duration::minutes(10));
    let stale_nodes = chrono::Duration::from_std(config.stale_threshold)
        .unwrap_or_else(|_| chrono::Duration::minutes(2));
    let retention = chrono::Duration::from_std(config.node_retention)
        .unwrap_or_else(|_| chrono::Duration::days(1));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.sweep_interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match queue.reset_timed_out().await {
            Ok((0, _)) => {}
            Ok((failed, scan_ids)) => {
                info!(failed, scans = scan_ids.len(), "sweeper timed out jobs")
            }
            Err(e) => warn!(error = %e, "timeout sweep failed"),
        }
        if let Err(e) = queue.reset_stale_claimed(stale_claim).await {
            warn!(error = %e, "stale-claim sweep failed");
        }
        if let Err(e) = registry.reset_jobs_from_stale_workers(stale_nodes).await {
            warn!(error = %e, "stale-worker recovery failed");
        }
        if let Err(e) = registry.delete_old(retention).await {
            warn!(error = %e, "node retention sweep failed");
        }
    }
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL`
/// env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
