// Error taxonomy for the monitoring and healing core
// Refusals and missing targets are not errors; see healing::HealOutcome

use thiserror::Error;

/// Result alias used across the library
pub type MedicResult<T> = Result<T, MedicError>;

/// Errors surfaced by controller I/O, discovery and the store
#[derive(Debug, Error)]
pub enum MedicError {
    /// Transient transport failure (retried with backoff before surfacing)
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential rejected by the controller; terminal for that channel
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Controller reported the resource does not exist (HTTP 404)
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Controller answered with an unexpected status
    #[error("controller returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// Message did not follow the websocket protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every discovery strategy failed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MedicError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, MedicError::Connection(_) | MedicError::Protocol(_))
    }
}

/// Errors raised by the SQLite store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MedicError::Connection("reset".into()).is_transient());
        assert!(!MedicError::Auth("bad token".into()).is_transient());
        assert!(!MedicError::NotFound("sensor.x".into()).is_transient());
    }

    #[test]
    fn test_store_error_converts() {
        let err: MedicError = StoreError::Corrupt("bad timestamp".into()).into();
        assert!(matches!(err, MedicError::Store(_)));
        assert!(err.to_string().contains("bad timestamp"));
    }
}
