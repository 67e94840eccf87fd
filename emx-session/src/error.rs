//! Error types for emx-session
//!
//! The session-engine taxonomy: per-source fetch failures, fatal sequencing
//! failures, ledger write races and quota lookup failures, plus the usual
//! infrastructure errors. Navigation denials are not errors; see
//! [`crate::navigator::NavigationOutcome`].

use thiserror::Error;

/// Main error type for emx-session
#[derive(Error, Debug)]
pub enum Error {
    /// One step source failed or timed out; logged and skipped by the aggregator
    #[error("Config fetch error ({source_kind}): {message}")]
    ConfigFetch {
        source_kind: String,
        message: String,
    },

    /// No usable step sequence could be built
    #[error("Sequencing error: {0}")]
    Sequencing(String),

    /// A ledger write lost a race with a concurrent mutation
    #[error("Persistence conflict after {attempts} attempt(s)")]
    PersistenceConflict { attempts: u32 },

    /// Quota configuration could not be read
    #[error("Quota config unavailable: {0}")]
    QuotaConfigUnavailable(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] emx_common::Error),

    /// Outbound HTTP errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the caller should retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PersistenceConflict { .. })
    }
}

/// Convenience Result type using emx-session Error
pub type Result<T> = std::result::Result<T, Error>;
