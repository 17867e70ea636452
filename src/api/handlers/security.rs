//! Security monitor handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::{validation_error, ApiError};
use crate::api::types::{IngestEventsRequest, IngestEventsResponse, SecurityEventsQuery};
use crate::domain::Severity;
use crate::server::AppState;

const MAX_INGEST_BATCH: usize = 1000;
const DEFAULT_EVENTS_LIMIT: u32 = 100;
const MAX_EVENTS_LIMIT: u32 = 1000;

/// POST /api/v1/security/events/ingest - Run operational events through the
/// detectors synchronously and return whatever they raised.
pub async fn ingest_events(
    State(state): State<AppState>,
    Json(request): Json<IngestEventsRequest>,
) -> Result<Json<IngestEventsResponse>, ApiError> {
    if request.events.is_empty() {
        return Err(validation_error("events", "at least one event is required"));
    }
    if request.events.len() > MAX_INGEST_BATCH {
        return Err(validation_error(
            "events",
            format!("at most {MAX_INGEST_BATCH} events per request"),
        ));
    }

    let mut response = IngestEventsResponse {
        accepted: 0,
        failed: 0,
        security_events: Vec::new(),
    };
    for event in request.events {
        match state.monitor.observe(event).await {
            Ok(raised) => {
                response.accepted += 1;
                response.security_events.extend(raised);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Operational event rejected by monitor");
                response.failed += 1;
            }
        }
    }

    Ok(Json(response))
}

/// GET /api/v1/security/events?since&severity&limit - Newest first.
pub async fn list_security_events(
    State(state): State<AppState>,
    Query(query): Query<SecurityEventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let severity = match query.severity.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<Severity>()
                .map_err(|e| validation_error("severity", e))?,
        ),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);

    let events = state.monitor.events_since(since, severity, limit).await?;
    Ok(Json(serde_json::json!({
        "since": since,
        "events": events,
        "count": events.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub actor: Option<String>,
}

/// POST /api/v1/security/events/:id/resolve
pub async fn resolve_security_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let actor = query
        .actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "admin".to_string());
    state.monitor.resolve(id, &actor).await?;
    Ok(Json(serde_json::json!({
        "id": id,
        "resolved": true,
    })))
}

/// GET /api/v1/security/threat-level
pub async fn get_threat_level(State(state): State<AppState>) -> Json<serde_json::Value> {
    let level = state.monitor.threat_level().await;
    Json(serde_json::json!({
        "threat_level": level,
        "value": level.as_gauge(),
        "assessed_at": Utc::now(),
    }))
}
