//! Health, readiness and metrics endpoints
//!
//! - `/health` is a liveness check and never touches storage
//! - `/ready` pings the storage backend and checks the zone catalog
//! - `/metrics` exports the registry as Prometheus text (or JSON with
//!   `?format=json`)

use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::{ComponentHealth, HealthStatus};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// Basic health check endpoint.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "planting-verifier",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness check endpoint.
///
/// 503 when storage is unreachable or no active zone is loaded; a catalog
/// with only inactive zones is reported degraded but still ready to reject.
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let start = Instant::now();
    let database = state.health.ping().await;
    let response_time_ms = start.elapsed().as_millis() as u64;

    let zones = state.zones.snapshot().await;
    let zone_catalog = if zones.is_empty() {
        ComponentHealth::Unhealthy {
            reason: "zone catalog is empty".to_string(),
        }
    } else if !zones.iter().any(|z| z.active) {
        ComponentHealth::Degraded {
            reason: "no active zones".to_string(),
        }
    } else {
        ComponentHealth::Healthy
    };

    let health = HealthStatus {
        database,
        zone_catalog,
    };
    let ready = health.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
            "components": health,
            "zones": zones.len(),
            "response_time_ms": response_time_ms,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

/// Metrics endpoint.
pub async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Response {
    if query.format.as_deref() == Some("json") {
        return Json(state.metrics.to_json().await).into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
        .into_response()
}
