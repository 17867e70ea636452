//! Reviewer handlers: manual overrides, the pending queue and the zone
//! catalog.
//!
//! Authentication happens upstream; the acting admin is named in the body.

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::{validation_error, ApiError};
use crate::api::types::{OverrideBody, PendingQuery, PendingResponse};
use crate::domain::{EvidenceId, PlantingZone, VerificationLog};
use crate::server::AppState;

const DEFAULT_PENDING_LIMIT: u32 = 50;
const MAX_PENDING_LIMIT: u32 = 500;

/// POST /api/v1/admin/evidence/:id/override - Append a manual decision.
pub async fn override_verification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OverrideBody>,
) -> Result<Json<VerificationLog>, ApiError> {
    let request = body.into_request(EvidenceId::from_uuid(id));
    let log = state.service.override_decision(request).await?;
    Ok(Json(log))
}

/// GET /api/v1/admin/verifications/pending - Submissions awaiting a decision.
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .clamp(1, MAX_PENDING_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let items = state.service.pending(limit, offset).await?;
    Ok(Json(PendingResponse {
        count: items.len(),
        items,
        limit,
        offset,
    }))
}

/// GET /api/v1/admin/zones - Current catalog snapshot.
pub async fn list_zones(State(state): State<AppState>) -> Json<serde_json::Value> {
    let zones = state.zones.snapshot().await;
    Json(serde_json::json!({
        "zones": zones.as_slice(),
        "count": zones.len(),
    }))
}

/// PUT /api/v1/admin/zones/:id - Create or replace a zone.
pub async fn upsert_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(zone): Json<PlantingZone>,
) -> Result<Json<PlantingZone>, ApiError> {
    if zone.id != id {
        return Err(validation_error(
            "id",
            format!("zone id {:?} does not match path {:?}", zone.id, id),
        ));
    }

    state.zones.upsert(zone.clone()).await?;
    tracing::info!(zone_id = %zone.id, active = zone.active, "Zone catalog updated");
    Ok(Json(zone))
}
