use uuid::Uuid;

use crate::types::ScanStatus;

/// Errors surfaced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Precondition failure on a scan transition. Never retried.
    #[error("scan {scan_id} is '{current}', expected one of [{required}]")]
    InvalidScanStatus {
        scan_id: Uuid,
        current: ScanStatus,
        required: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unknown {what}: '{value}'")]
    UnknownValue { what: &'static str, value: String },

    /// Unique/foreign-key violation surfaced from the storage layer;
    /// the core performs no silent fixup.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn unknown(what: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            what,
            value: value.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
