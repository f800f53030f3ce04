use thiserror::Error;

/// Failure taxonomy for the replication engine.
///
/// Only `Network` and `Timeout` are retryable; everything else either aborts
/// the current table or the whole session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("gateway network error: {0}")]
    Network(String),
    #[error("gateway request timed out: {0}")]
    Timeout(String),
    #[error("gateway returned no rows for company '{company}' on the pre-truncate probe; the company is likely not active on the gateway")]
    EmptyGateway { company: String },
    #[error("failed to decode gateway response for table '{table}': {detail}")]
    Decode { table: String, detail: String },
    #[error("store write failed: {0}")]
    StoreWrite(String),
    #[error("a sync session is already active")]
    Concurrency,
    #[error("sync cancelled")]
    Cancelled,
    #[error("circuit breaker is open for dependency '{0}'")]
    CircuitOpen(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for transient transport failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }

    pub fn decode(table: &str, detail: impl Into<String>) -> Self {
        SyncError::Decode {
            table: table.to_string(),
            detail: detail.into(),
        }
    }
}
