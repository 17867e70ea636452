//! Error types for the verification infrastructure

use thiserror::Error;
use uuid::Uuid;

use crate::domain::EvidenceId;

/// Errors that can occur in the verification pipeline and its stores
#[derive(Error, Debug)]
pub enum VerificationError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Evidence not found
    #[error("evidence not found: {0}")]
    EvidenceNotFound(EvidenceId),

    /// Evidence already submitted under this id
    #[error("duplicate evidence: {0}")]
    DuplicateEvidence(EvidenceId),

    /// No verification log exists yet
    #[error("no verification log for evidence {0}")]
    LogNotFound(EvidenceId),

    /// A second unsuperseding log row for the same evidence
    #[error("initial verification log already exists for {0}")]
    InitialLogExists(EvidenceId),

    /// Security event not found
    #[error("security event not found: {0}")]
    EventNotFound(Uuid),

    /// Submission failed intake validation
    #[error("malformed evidence: {0}")]
    MalformedEvidence(String),

    /// Zone catalog is inconsistent (overlapping or malformed polygons)
    #[error("zone conflict: {0}")]
    ZoneConflict(String),

    /// An external collaborator failed
    #[error("{service} unavailable: {message}")]
    Collaborator { service: String, message: String },

    /// A checker or collaborator exceeded its deadline
    #[error("timed out: {checker}")]
    Timeout { checker: String },

    /// Invalid override request
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl VerificationError {
    pub fn collaborator(service: impl Into<String>, message: impl ToString) -> Self {
        VerificationError::Collaborator {
            service: service.into(),
            message: message.to_string(),
        }
    }

    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            VerificationError::Collaborator { .. } | VerificationError::Timeout { .. } => true,
            VerificationError::Database(e) => super::retry::is_retryable_db_error(e),
            _ => false,
        }
    }
}

/// Result type for verification operations
pub type Result<T> = std::result::Result<T, VerificationError>;
