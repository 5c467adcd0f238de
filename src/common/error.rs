//! Error types for minitrans

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Transaction Errors ===
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict on {resource}: held by transaction {holder}")]
    Conflict { resource: String, holder: u64 },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Transaction not found: {0}")]
    NotFound(u64),

    // === Remote Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error? Conflicts are not: the caller decides.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }

    /// Result code carried in origin notifications
    pub fn code(&self) -> i32 {
        use crate::trans::code;
        match self {
            Error::Conflict { .. } => code::CONFLICT,
            Error::InvalidState(_) => code::INVALID_STATE,
            Error::PersistenceFailure(_) | Error::RocksDb(_) | Error::Io(_) => {
                code::PERSISTENCE_FAILURE
            }
            Error::Transport(_) => code::NETWORK_UNAVAILABLE,
            _ => code::INTERNAL,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::InvalidState(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
