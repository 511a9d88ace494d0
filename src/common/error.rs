//! Error types for minishard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Store Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Catalog store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Resharding Errors ===
    #[error("Participant {shard} failed: {reason}")]
    ParticipantFailed { shard: String, reason: String },

    #[error("Resharding aborted: {0}")]
    Aborted(String),

    #[error("Conflicting operation: {0}")]
    Conflict(String),

    #[error("Unknown participant {shard} for operation {operation_id}")]
    UnknownParticipant { operation_id: String, shard: String },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Coordinator lost ownership of the operation")]
    Cancelled,

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient infrastructure failure that the failing step retries itself
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::Io(_)
                | Error::RocksDb(_)
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
        )
    }

    /// Programming error: the instance is torn down and rebuilt from the durable record
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_) | Error::MetadataCorrupted(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::UnknownParticipant { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::StoreUnavailable(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_error_classification() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(!Error::Aborted("user".into()).is_retryable());
        assert!(!Error::ParticipantFailed {
            shard: "shard-a".into(),
            reason: "disk full".into()
        }
        .is_retryable());

        assert!(Error::InvariantViolation("phase".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::NotFound("op".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("busy".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Internal("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
