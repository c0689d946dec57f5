//! Error types and result handling for the meshguard control plane

use thiserror::Error;

/// Result type alias for meshguard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshguard operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Partial result: {0}")]
    Partial(String),

    #[error("Policy conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Permanent upstream failure: {0}")]
    PermanentFailure(String),

    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Governance block: {0}")]
    GovernanceBlocked(String),

    #[error("Privacy budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Fatal component error: {0}")]
    FatalComponent(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::Timeout(_) | Error::Storage(_)
        )
    }

    /// Check if the error must take the owning component out of service
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalComponent(_) | Error::Internal(_))
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Unavailable(_) => "unavailable",
            Error::Query(_) => "query",
            Error::Partial(_) => "partial",
            Error::Conflict(_) => "conflict",
            Error::Timeout(_) => "timeout",
            Error::PermanentFailure(_) => "permanent",
            Error::Integrity(_) => "integrity",
            Error::GovernanceBlocked(_) => "governance",
            Error::BudgetExhausted(_) => "budget",
            Error::Cancelled => "cancelled",
            Error::Storage(_) => "storage",
            Error::FatalComponent(_) => "fatal",
            Error::Internal(_) => "internal",
            Error::Serialization(_) => "serialization",
            Error::Generic(_) => "generic",
        }
    }
}
