//! HTTP clients for the external collaborators
//!
//! Every call runs inside the collaborator's circuit breaker with a
//! deadline. A tripped breaker fails fast with `Collaborator`, an elapsed
//! deadline surfaces as `Timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Attestation, DateRange, EvidenceId, GeoPoint, Imagery, PhotoAssessment, PlanterId,
    SecurityEvent, VegetationChange, WeatherConditions,
};

use super::{
    AlertSink, AttestationSource, CircuitBreaker, CircuitBreakerRegistry, ElevationService,
    ImageryService, InferenceService, PhotoStorage, Result, RewardIssuer, VerificationError,
    WeatherService,
};

// ============================================================================
// Configuration
// ============================================================================

/// Collaborator endpoints
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub elevation_url: String,
    pub weather_url: String,
    pub weather_api_key: Option<String>,
    pub imagery_url: String,
    pub inference_url: String,
    pub storage_url: String,
    pub reward_webhook_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub attestation_url: Option<String>,
    /// Transport-level timeout. Per-check deadlines are enforced separately.
    pub request_timeout: Duration,
}

impl CollaboratorConfig {
    pub fn from_env() -> Self {
        let optional = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let url = |key: &str, default: &str| optional(key).unwrap_or_else(|| default.to_string());

        Self {
            elevation_url: url("ELEVATION_API_URL", "http://localhost:8081"),
            weather_url: url("WEATHER_API_URL", "http://localhost:8082"),
            weather_api_key: optional("WEATHER_API_KEY"),
            imagery_url: url("IMAGERY_API_URL", "http://localhost:8083"),
            inference_url: url("INFERENCE_API_URL", "http://localhost:8084"),
            storage_url: url("STORAGE_GATEWAY_URL", "http://localhost:8085"),
            reward_webhook_url: optional("REWARD_WEBHOOK_URL"),
            alert_webhook_url: optional("ALERT_WEBHOOK_URL"),
            attestation_url: optional("ATTESTATION_API_URL"),
            request_timeout: Duration::from_millis(
                optional("COLLABORATOR_TIMEOUT_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15_000),
            ),
        }
    }
}

// ============================================================================
// Shared transport
// ============================================================================

/// One collaborator endpoint behind its own breaker
#[derive(Clone)]
pub struct HttpCollaborator {
    service: &'static str,
    client: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    api_key: Option<String>,
}

impl HttpCollaborator {
    pub async fn new(
        service: &'static str,
        base_url: impl Into<String>,
        client: reqwest::Client,
        registry: &CircuitBreakerRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            breaker: registry.get_or_create(service).await,
            timeout,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn error(&self, e: impl std::fmt::Display) -> VerificationError {
        VerificationError::collaborator(self.service, e)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    /// Send and return the response when it is a success; `None` on 404.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Option<reqwest::Response>> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(self.error(format!("HTTP {status}")));
        }
        Ok(Some(response))
    }

    async fn json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        self.breaker
            .guard(self.timeout, async {
                let response = self
                    .send(request)
                    .await?
                    .ok_or_else(|| self.error("HTTP 404 Not Found"))?;
                response.json::<T>().await.map_err(|e| self.error(e))
            })
            .await
    }

    async fn optional_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>> {
        self.breaker
            .guard(self.timeout, async {
                match self.send(request).await? {
                    Some(response) => response.json::<T>().await.map(Some).map_err(|e| self.error(e)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn bytes(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        self.breaker
            .guard(self.timeout, async {
                let response = self
                    .send(request)
                    .await?
                    .ok_or_else(|| self.error("HTTP 404 Not Found"))?;
                let body = response.bytes().await.map_err(|e| self.error(e))?;
                Ok(body.to_vec())
            })
            .await
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, body: &B) -> Result<()> {
        let request = self.client.post(&self.base_url).json(body);
        self.breaker
            .guard(self.timeout, async {
                self.send(request).await?;
                Ok(())
            })
            .await
    }
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Deserialize)]
struct ElevationResponse {
    elevation_m: f64,
}

pub struct HttpElevationService(pub HttpCollaborator);

#[async_trait]
impl ElevationService for HttpElevationService {
    async fn get_elevation(&self, location: GeoPoint) -> Result<f64> {
        let request = self
            .0
            .client
            .get(self.0.url("elevation"))
            .query(&[("lat", location.lat), ("lon", location.lon)]);
        let response: ElevationResponse = self.0.json(request).await?;
        Ok(response.elevation_m)
    }
}

pub struct HttpWeatherService(pub HttpCollaborator);

#[async_trait]
impl WeatherService for HttpWeatherService {
    async fn get_conditions(&self, location: GeoPoint, at: DateTime<Utc>) -> Result<WeatherConditions> {
        let request = self.0.client.get(self.0.url("conditions")).query(&[
            ("lat", location.lat.to_string()),
            ("lon", location.lon.to_string()),
            ("at", at.to_rfc3339()),
        ]);
        self.0.json(request).await
    }
}

#[derive(Serialize)]
struct ImagerySearch {
    location: GeoPoint,
    window: DateRange,
    max_cloud_cover: f64,
}

#[derive(Serialize)]
struct VegetationComparison<'a> {
    location: GeoPoint,
    before: &'a Imagery,
    after: &'a Imagery,
}

pub struct HttpImageryService(pub HttpCollaborator);

#[async_trait]
impl ImageryService for HttpImageryService {
    async fn search_imagery(
        &self,
        location: GeoPoint,
        window: DateRange,
        max_cloud_cover: f64,
    ) -> Result<Vec<Imagery>> {
        let request = self.0.client.post(self.0.url("search")).json(&ImagerySearch {
            location,
            window,
            max_cloud_cover,
        });
        self.0.json(request).await
    }

    async fn analyze_vegetation_change(
        &self,
        location: GeoPoint,
        before: &Imagery,
        after: &Imagery,
    ) -> Result<VegetationChange> {
        let request = self
            .0
            .client
            .post(self.0.url("vegetation-change"))
            .json(&VegetationComparison {
                location,
                before,
                after,
            });
        self.0.json(request).await
    }
}

#[derive(Deserialize)]
struct TreeCount {
    count: u32,
}

#[derive(Deserialize)]
struct SpeciesList {
    species: Vec<String>,
}

pub struct HttpInferenceService(pub HttpCollaborator);

impl HttpInferenceService {
    fn image_request(&self, path: &str, image: &[u8]) -> reqwest::RequestBuilder {
        self.0
            .client
            .post(self.0.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
    }
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    async fn detect_trees(&self, image: &[u8]) -> Result<u32> {
        let response: TreeCount = self.0.json(self.image_request("detect-trees", image)).await?;
        Ok(response.count)
    }

    async fn classify_species(&self, image: &[u8]) -> Result<Vec<String>> {
        let response: SpeciesList = self
            .0
            .json(self.image_request("classify-species", image))
            .await?;
        Ok(response.species)
    }

    async fn assess_photo(&self, image: &[u8]) -> Result<PhotoAssessment> {
        self.0.json(self.image_request("assess", image)).await
    }
}

pub struct HttpPhotoStorage(pub HttpCollaborator);

#[async_trait]
impl PhotoStorage for HttpPhotoStorage {
    async fn get_bytes(&self, content_hash: &str) -> Result<Vec<u8>> {
        let request = self.0.client.get(self.0.url(&format!("photos/{content_hash}")));
        self.0.bytes(request).await
    }
}

pub struct HttpAttestationSource(pub HttpCollaborator);

#[async_trait]
impl AttestationSource for HttpAttestationSource {
    async fn attestation_for(&self, evidence_id: EvidenceId) -> Result<Option<Attestation>> {
        let request = self
            .0
            .client
            .get(self.0.url(&format!("attestations/{evidence_id}")));
        self.0.optional_json(request).await
    }
}

#[derive(Serialize)]
struct RewardNotification<'a> {
    evidence_id: EvidenceId,
    planter_id: &'a PlanterId,
    trees_verified: u32,
}

/// Reward issuance webhook. The base URL is the full webhook URL.
pub struct WebhookRewardIssuer(pub HttpCollaborator);

#[async_trait]
impl RewardIssuer for WebhookRewardIssuer {
    async fn on_verified(
        &self,
        evidence_id: EvidenceId,
        planter_id: &PlanterId,
        trees_verified: u32,
    ) -> Result<()> {
        self.0
            .post_unit(&RewardNotification {
                evidence_id,
                planter_id,
                trees_verified,
            })
            .await
    }
}

/// Alert webhook. The base URL is the full webhook URL.
pub struct WebhookAlertSink(pub HttpCollaborator);

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn raise_alert(&self, event: &SecurityEvent) -> Result<()> {
        self.0.post_unit(event).await
    }
}

/// Reward issuer used when no webhook is configured.
pub struct LoggingRewardIssuer;

#[async_trait]
impl RewardIssuer for LoggingRewardIssuer {
    async fn on_verified(
        &self,
        evidence_id: EvidenceId,
        planter_id: &PlanterId,
        trees_verified: u32,
    ) -> Result<()> {
        tracing::info!(
            evidence_id = %evidence_id,
            planter_id = %planter_id,
            trees_verified,
            "Reward notification (no webhook configured)"
        );
        Ok(())
    }
}

/// Alert sink used when no webhook is configured.
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn raise_alert(&self, event: &SecurityEvent) -> Result<()> {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            source = %event.source,
            "{}",
            event.description
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{CircuitBreakerConfig, CircuitState};
    use axum::{extract::Query, routing::get, Json, Router};
    use std::collections::HashMap;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn elevation_client_decodes_response() {
        let router = Router::new().route(
            "/elevation",
            get(|Query(q): Query<HashMap<String, f64>>| async move {
                Json(serde_json::json!({ "elevation_m": q["lat"] * 100.0 }))
            }),
        );
        let base = spawn_server(router).await;
        let registry = CircuitBreakerRegistry::new();
        let client = HttpCollaborator::new(
            "elevation",
            base,
            reqwest::Client::new(),
            &registry,
            Duration::from_secs(5),
        )
        .await;

        let elevation = HttpElevationService(client)
            .get_elevation(GeoPoint::new(18.0, -72.0))
            .await
            .unwrap();
        assert!((elevation - 1800.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_attestation_is_none() {
        let base = spawn_server(Router::new()).await;
        let registry = CircuitBreakerRegistry::new();
        let client = HttpCollaborator::new(
            "attestation",
            base,
            reqwest::Client::new(),
            &registry,
            Duration::from_secs(5),
        )
        .await;

        let attestation = HttpAttestationSource(client)
            .attestation_for(EvidenceId::new())
            .await
            .unwrap();
        assert!(attestation.is_none());
    }

    #[tokio::test]
    async fn server_errors_trip_the_breaker() {
        let router = Router::new().route(
            "/elevation",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base = spawn_server(router).await;
        let registry = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        let client = HttpCollaborator::new(
            "elevation",
            base,
            reqwest::Client::new(),
            &registry,
            Duration::from_secs(5),
        )
        .await;
        let breaker = client.breaker.clone();
        let service = HttpElevationService(client);

        for _ in 0..2 {
            assert!(service.get_elevation(GeoPoint::new(18.0, -72.0)).await.is_err());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        let err = service
            .get_elevation(GeoPoint::new(18.0, -72.0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
    }
}
