//! Structured API error responses
//!
//! Every handler error is rendered as
//!
//! ```json
//! {
//!   "error": {
//!     "code": "EVIDENCE_NOT_FOUND",
//!     "numeric_code": 4001,
//!     "message": "Evidence not found: 7d6c...",
//!     "resource_id": "7d6c..."
//!   }
//! }
//! ```
//!
//! Numeric codes are grouped by category:
//! - 3xxx request validation
//! - 4xxx missing resources
//! - 5xxx conflicts
//! - 8xxx infrastructure

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::VerificationError;

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation (3xxx)
    InvalidRequestBody,
    InvalidFieldValue,
    MalformedEvidence,
    InvalidOverride,

    // Resource (4xxx)
    EvidenceNotFound,
    LogNotFound,
    EventNotFound,
    ZoneNotFound,

    // Conflict (5xxx)
    DuplicateEvidence,
    ZoneConflict,

    // Infrastructure (8xxx)
    DatabaseError,
    ServiceUnavailable,
    Timeout,
    InternalError,
}

impl ErrorCode {
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3002,
            ErrorCode::MalformedEvidence => 3003,
            ErrorCode::InvalidOverride => 3004,

            ErrorCode::EvidenceNotFound => 4001,
            ErrorCode::LogNotFound => 4002,
            ErrorCode::EventNotFound => 4003,
            ErrorCode::ZoneNotFound => 4004,

            ErrorCode::DuplicateEvidence => 5001,
            ErrorCode::ZoneConflict => 5002,

            ErrorCode::DatabaseError => 8001,
            ErrorCode::ServiceUnavailable => 8002,
            ErrorCode::Timeout => 8003,
            ErrorCode::InternalError => 8999,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequestBody
            | ErrorCode::InvalidFieldValue
            | ErrorCode::MalformedEvidence
            | ErrorCode::InvalidOverride => StatusCode::BAD_REQUEST,

            ErrorCode::EvidenceNotFound
            | ErrorCode::LogNotFound
            | ErrorCode::EventNotFound
            | ErrorCode::ZoneNotFound => StatusCode::NOT_FOUND,

            ErrorCode::DuplicateEvidence | ErrorCode::ZoneConflict => StatusCode::CONFLICT,

            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::MalformedEvidence => "MALFORMED_EVIDENCE",
            ErrorCode::InvalidOverride => "INVALID_OVERRIDE",
            ErrorCode::EvidenceNotFound => "EVIDENCE_NOT_FOUND",
            ErrorCode::LogNotFound => "LOG_NOT_FOUND",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::ZoneNotFound => "ZONE_NOT_FOUND",
            ErrorCode::DuplicateEvidence => "DUPLICATE_EVIDENCE",
            ErrorCode::ZoneConflict => "ZONE_CONFLICT",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                resource_id: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.as_str();
        let mut response = (status, Json(self)).into_response();

        // Error code header for log correlation at the proxy
        response.headers_mut().insert(
            axum::http::header::HeaderName::from_static("x-error-code"),
            axum::http::HeaderValue::from_static(code_str),
        );

        response
    }
}

// ============================================================================
// Conversion from VerificationError
// ============================================================================

impl From<VerificationError> for ApiError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::Database(e) => {
                tracing::error!(error = %e, "Database error while serving request");
                ApiError::new(ErrorCode::DatabaseError, "Database error")
            }
            VerificationError::EvidenceNotFound(id) => {
                ApiError::new(ErrorCode::EvidenceNotFound, format!("Evidence not found: {id}"))
                    .with_resource_id(id.to_string())
            }
            VerificationError::DuplicateEvidence(id) => ApiError::new(
                ErrorCode::DuplicateEvidence,
                format!("Evidence already submitted: {id}"),
            )
            .with_resource_id(id.to_string()),
            VerificationError::LogNotFound(id) => ApiError::new(
                ErrorCode::LogNotFound,
                format!("No verification log for evidence {id}"),
            )
            .with_resource_id(id.to_string()),
            // A lost append race is resolved inside the service; reaching
            // here means the store is inconsistent.
            VerificationError::InitialLogExists(id) => ApiError::new(
                ErrorCode::InternalError,
                format!("Conflicting verification log for evidence {id}"),
            )
            .with_resource_id(id.to_string()),
            VerificationError::EventNotFound(id) => {
                ApiError::new(ErrorCode::EventNotFound, format!("Security event not found: {id}"))
                    .with_resource_id(id.to_string())
            }
            VerificationError::MalformedEvidence(msg) => {
                ApiError::new(ErrorCode::MalformedEvidence, msg)
            }
            VerificationError::ZoneConflict(msg) => ApiError::new(ErrorCode::ZoneConflict, msg),
            VerificationError::Collaborator { service, message } => ApiError::new(
                ErrorCode::ServiceUnavailable,
                format!("{service} unavailable: {message}"),
            )
            .with_details(serde_json::json!({ "service": service })),
            VerificationError::Timeout { checker } => {
                ApiError::new(ErrorCode::Timeout, format!("Timed out waiting for {checker}"))
            }
            VerificationError::InvalidOverride(msg) => {
                ApiError::new(ErrorCode::InvalidOverride, msg)
            }
            VerificationError::Serialization(e) => {
                ApiError::new(ErrorCode::InvalidRequestBody, format!("Invalid JSON: {e}"))
            }
            VerificationError::Configuration(msg) => {
                ApiError::new(ErrorCode::InternalError, format!("Configuration error: {msg}"))
            }
            VerificationError::Internal(msg) => ApiError::new(ErrorCode::InternalError, msg),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Create a not found error for a specific resource type
pub fn not_found(code: ErrorCode, resource_type: &str, id: impl std::fmt::Display) -> ApiError {
    ApiError::new(code, format!("{resource_type} not found: {id}")).with_resource_id(id.to_string())
}

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into())
        .with_details(serde_json::json!({ "field": field }))
}
