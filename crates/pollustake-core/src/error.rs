use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Connectivity loss, pool exhaustion, lock timeouts. Safe to retry next cycle.
    #[error("backend error: {0}")]
    Backend(String),

    /// Missing schema or an unusable connection at startup.
    #[error("schema error: {0}")]
    Schema(String),
}

/// Coarse error classes used to pick a handling policy (reject, retry, abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Fatal,
}

/// Compliance core errors.
#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    #[error("sensor feed failed for '{entity_id}': {message}")]
    Feed { entity_id: String, message: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl ComplianceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::EntityNotFound(_) => ErrorKind::Validation,
            Self::Feed { .. } => ErrorKind::Transient,
            Self::Store(StoreError::Backend(_)) => ErrorKind::Transient,
            Self::Store(StoreError::NotFound(_)) | Self::Store(StoreError::InvalidInput(_)) => {
                ErrorKind::Validation
            }
            Self::Store(StoreError::InvariantViolation(_)) | Self::Store(StoreError::Schema(_)) => {
                ErrorKind::Fatal
            }
        }
    }
}
