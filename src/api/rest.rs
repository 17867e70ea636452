//! REST API routes for the planting verifier.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::Router;

use super::handlers::*;
use crate::domain::{OperationalEvent, SecurityEventType};
use crate::server::AppState;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Evidence
        .route("/v1/evidence", post(submit_evidence))
        .route("/v1/evidence/:id/verify", post(verify_evidence))
        .route("/v1/evidence/:id/logs", get(get_verification_logs))
        // Admin
        .route(
            "/v1/admin/evidence/:id/override",
            post(override_verification),
        )
        .route("/v1/admin/verifications/pending", get(list_pending))
        .route("/v1/admin/zones", get(list_zones))
        .route("/v1/admin/zones/:id", put(upsert_zone))
        // Security monitor
        .route("/v1/security/events/ingest", post(ingest_events))
        .route("/v1/security/events", get(list_security_events))
        .route(
            "/v1/security/events/:id/resolve",
            post(resolve_security_event),
        )
        .route("/v1/security/threat-level", get(get_threat_level))
}

/// Root-level operational endpoints.
pub fn ops_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
}

/// Feed API traffic to the security monitor.
///
/// Runs after the handler so the status code is known. The event is queued,
/// never awaited; a full queue drops it.
pub async fn observe_traffic(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(handle) = state.monitor_handle.clone() else {
        return next.run(request).await;
    };

    let source = client_source(&request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let response = next.run(request).await;

    let status = response.status();
    let mut event = OperationalEvent::new(source)
        .action(format!("{} {}", method, path))
        .path(match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        })
        .metric("status", f64::from(status.as_u16()));
    if status == axum::http::StatusCode::TOO_MANY_REQUESTS {
        event = event.event_type(SecurityEventType::RateLimitExceeded);
    } else if status == axum::http::StatusCode::UNAUTHORIZED
        || status == axum::http::StatusCode::FORBIDDEN
    {
        event = event.event_type(SecurityEventType::UnauthorizedAccess);
    }
    handle.observe(event);

    response
}

/// First hop of `x-forwarded-for`, else `x-real-ip`, else "unknown".
fn client_source(request: &Request) -> String {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
