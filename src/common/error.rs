//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Storage engine is closed")]
    Closed,

    // === Replication Errors ===
    #[error("Invalid replication factor: {0}")]
    InvalidReplication(String),

    #[error("Quorum not reached: {acks} of {required} acks")]
    Quorum { acks: usize, required: usize },

    #[error("Malformed replica response: {0}")]
    Protocol(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Request / Config Errors ===
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Did a replica fail in a way that should count against the quorum?
    pub fn is_replica_failure(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout(_) | Error::Protocol(_) | Error::Io(_) | Error::Closed
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidReplication(_) | Error::InvalidKey(_) | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Quorum { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
