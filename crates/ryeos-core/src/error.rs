//! Error taxonomy for the ryeos host
//!
//! Every variant carries a human-readable message; `kind()` yields the
//! machine-readable kind string placed in protocol error responses.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("integrity failure: {reason}")]
    Integrity { reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("chain invalid: {0}")]
    Chain(String),

    #[error("stale lockfile: {0}; re-sign the chain and delete the lockfile")]
    StaleLockfile(String),

    #[error("permission denied: no capability grants {required}")]
    PermissionDenied { required: String },

    #[error("limit exceeded: {axis} ({used} of {max})")]
    LimitExceeded { axis: String, used: String, max: String },

    #[error("budget reservation failed: {0}")]
    BudgetReservation(String),

    #[error("risk blocked: capability {capability} classified {tier} without acknowledgment")]
    RiskBlocked { capability: String, tier: String },

    #[error("cancellation requested")]
    Cancelled,

    #[error("timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("primitive failed: {0}")]
    Primitive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind string for protocol responses and transcript events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::Integrity { .. } => "IntegrityError",
            Self::Validation(_) => "ValidationError",
            Self::Chain(_) => "ChainError",
            Self::StaleLockfile(_) => "StaleLockfile",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::LimitExceeded { .. } => "LimitExceeded",
            Self::BudgetReservation(_) => "BudgetReservation",
            Self::RiskBlocked { .. } => "RiskBlocked",
            Self::Cancelled => "CancellationRequested",
            Self::Timeout { .. } => "Timeout",
            Self::Primitive(_) => "PrimitiveError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "SerdeError",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity { reason: reason.into() }
    }

    pub fn chain(reason: impl Into<String>) -> Self {
        Self::Chain(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    pub fn limit(axis: &str, used: impl ToString, max: impl ToString) -> Self {
        Self::LimitExceeded {
            axis: axis.to_string(),
            used: used.to_string(),
            max: max.to_string(),
        }
    }
}
