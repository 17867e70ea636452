//! Evidence submission and verification handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{LogHistoryResponse, SubmitEvidenceResponse};
use crate::domain::{EvidenceId, VerificationLog};
use crate::pipeline::EvidenceSubmission;
use crate::server::AppState;

/// POST /api/v1/evidence - Validate and store a submission.
pub async fn submit_evidence(
    State(state): State<AppState>,
    Json(submission): Json<EvidenceSubmission>,
) -> Result<(StatusCode, Json<SubmitEvidenceResponse>), ApiError> {
    let evidence = state.service.submit(submission).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitEvidenceResponse::from(&evidence)),
    ))
}

/// POST /api/v1/evidence/:id/verify - Run (or return) the automated decision.
pub async fn verify_evidence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VerificationLog>, ApiError> {
    let log = state.service.verify(EvidenceId::from_uuid(id)).await?;
    Ok(Json(log))
}

/// GET /api/v1/evidence/:id/logs - Full decision history.
pub async fn get_verification_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LogHistoryResponse>, ApiError> {
    let evidence_id = EvidenceId::from_uuid(id);
    let logs = state.service.history(evidence_id).await?;
    Ok(Json(LogHistoryResponse::new(evidence_id, logs)))
}
