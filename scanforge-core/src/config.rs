//! Environment-driven configuration.
//!
//! Every tunable has a default; only `DATABASE_URL` is required. The daemon
//! resolves the DSN itself (CLI arg takes precedence over the env var) and
//! hands it in through `Config::from_env_with_dsn`.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Pool connections kept idle (`min_connections`).
    pub max_idle_conns: u32,
    /// Pool ceiling (`max_connections`).
    pub max_open_conns: u32,
    pub conn_max_lifetime: Duration,
    /// Worker slots hosted by this node.
    pub worker_count: usize,
    pub heartbeat_interval: Duration,
    /// A running node not seen for this long is stale.
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
    /// Optional prefix in front of `hostname-pid` node ids.
    pub node_prefix: Option<String>,
    /// Stopped nodes older than this are garbage-collected.
    pub node_retention: Duration,
    /// Claimed-but-never-started jobs older than this are re-armed.
    pub stale_claim_threshold: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dsn = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL is not set".into()))?;
        Self::from_env_with_dsn(dsn)
    }

    pub fn from_env_with_dsn(database_url: String) -> Result<Self> {
        Ok(Self {
            database_url,
            max_idle_conns: env_parse("SCANFORGE_MAX_IDLE_CONNS", 5)?,
            max_open_conns: env_parse("SCANFORGE_MAX_OPEN_CONNS", 20)?,
            conn_max_lifetime: Duration::from_secs(env_parse(
                "SCANFORGE_CONN_MAX_LIFETIME_SECS",
                3600,
            )?),
            worker_count: env_parse("SCANFORGE_WORKER_COUNT", 4)?,
            heartbeat_interval: Duration::from_secs(env_parse(
                "SCANFORGE_HEARTBEAT_INTERVAL_SECS",
                15,
            )?),
            stale_threshold: Duration::from_secs(env_parse("SCANFORGE_STALE_THRESHOLD_SECS", 120)?),
            sweep_interval: Duration::from_secs(env_parse("SCANFORGE_SWEEP_INTERVAL_SECS", 30)?),
            node_prefix: std::env::var("SCANFORGE_NODE_PREFIX").ok().filter(|s| !s.is_empty()),
            node_retention: Duration::from_secs(env_parse(
                "SCANFORGE_NODE_RETENTION_SECS",
                86_400,
            )?),
            stale_claim_threshold: Duration::from_secs(env_parse(
                "SCANFORGE_STALE_CLAIM_SECS",
                600,
            )?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}
