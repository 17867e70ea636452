//! HTTP server bootstrap for the planting verifier.
//!
//! This module wires together:
//! - configuration
//! - storage (PostgreSQL or in-memory)
//! - collaborator clients behind circuit breakers
//! - the verification service, security monitor and re-check worker
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Method, Request};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::anomaly::{InMemoryProfileStore, MonitorConfig, MonitorHandle, SecurityMonitor};
use crate::checks::{
    CommunityAttestation, DctPerceptualHasher, DuplicateConfig, DuplicateDetector,
    GeospatialConfig, GeospatialValidator, PhotoAnalyzer, PhotoConfig, TemporalChecker,
    TemporalConfig, VegetationAnalyzer, VegetationConfig, WeatherChecker, WeatherConfig,
    ZoneCatalog,
};
use crate::infra::{
    serve_with_shutdown, shutdown_signal, AlertSink, AuditSink, CircuitBreakerRegistry,
    CollaboratorConfig, EvidenceStore, GracefulShutdownConfig, HashIndex, HealthCheck,
    HttpAttestationSource, HttpCollaborator, HttpElevationService, HttpImageryService,
    HttpInferenceService, HttpPhotoStorage, HttpWeatherService, InMemoryAuditLog,
    InMemoryHashIndex, InMemoryPlantingHistory, InMemorySecurityEventStore, InMemoryStore,
    InMemoryZoneStore, LoggingAlertSink, LoggingRewardIssuer, PgAuditLogger, PgHashIndex,
    PgPlantingHistory, PgSecurityEventStore, PgStore, PgZoneStore, PlantingHistory,
    RewardIssuer, SecurityEventStore, ShutdownCoordinator, ShutdownSignal, VerificationLogStore,
    WebhookAlertSink, WebhookRewardIssuer, ZoneStore,
};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{PipelineConfig, RecheckWorker, VerificationService};
use crate::telemetry::{
    extract_context_from_headers, init_telemetry, shutdown_telemetry, TelemetryConfig,
};

/// Where evidence, logs and events are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Process-local; everything is lost on restart.
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StorageBackend::Postgres),
            "memory" | "in-memory" | "mem" => Ok(StorageBackend::Memory),
            other => anyhow::bail!("unknown STORAGE_BACKEND {other:?} (expected postgres or memory)"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    pub backend: StorageBackend,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/planting_verifier".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {host}:{port}: {e}"))?;

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let migrate_on_startup = std::env::var("DB_MIGRATE_ON_STARTUP")
            .ok()
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        let backend = match std::env::var("STORAGE_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => StorageBackend::Postgres,
        };

        Ok(Self {
            database_url,
            listen_addr,
            max_connections,
            migrate_on_startup,
            backend,
        })
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<VerificationService>,
    pub monitor: Arc<SecurityMonitor>,
    /// Queue for request traffic; `None` disables traffic observation.
    pub monitor_handle: Option<MonitorHandle>,
    pub zones: Arc<ZoneCatalog>,
    pub metrics: Arc<MetricsRegistry>,
    pub health: Arc<dyn HealthCheck>,
}

/// Every store the service and monitor need, for one backend.
struct Stores {
    evidence: Arc<dyn EvidenceStore>,
    logs: Arc<dyn VerificationLogStore>,
    health: Arc<dyn HealthCheck>,
    hash_index: Arc<dyn HashIndex>,
    history: Arc<dyn PlantingHistory>,
    zones: Arc<dyn ZoneStore>,
    security_events: Arc<dyn SecurityEventStore>,
    audit: Arc<dyn AuditSink>,
}

async fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            let store = Arc::new(InMemoryStore::new());
            Ok(Stores {
                evidence: store.clone(),
                logs: store.clone(),
                health: store,
                hash_index: Arc::new(InMemoryHashIndex::new()),
                history: Arc::new(InMemoryPlantingHistory::new()),
                zones: Arc::new(InMemoryZoneStore::new()),
                security_events: Arc::new(InMemorySecurityEventStore::new()),
                audit: Arc::new(InMemoryAuditLog::new()),
            })
        }
        StorageBackend::Postgres => {
            info!("Connecting to PostgreSQL...");
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url)
                .await?;
            info!("Connected to PostgreSQL");

            if config.migrate_on_startup {
                info!("Running database migrations...");
                crate::migrations::run_postgres(&pool).await?;
                info!("Database migrations applied");
            } else {
                info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
            }

            let store = Arc::new(PgStore::new(pool.clone()));
            Ok(Stores {
                evidence: store.clone(),
                logs: store.clone(),
                health: store,
                hash_index: Arc::new(PgHashIndex::new(pool.clone())),
                history: Arc::new(PgPlantingHistory::new(pool.clone())),
                zones: Arc::new(PgZoneStore::new(pool.clone())),
                security_events: Arc::new(PgSecurityEventStore::new(pool.clone())),
                audit: Arc::new(PgAuditLogger::new(pool)),
            })
        }
    }
}

/// A wired service graph plus the background monitor task.
pub struct Assembled {
    pub state: AppState,
    /// Drains queued operational events once `shutdown` fires.
    pub monitor_task: JoinHandle<()>,
}

/// Open storage, load the zone catalog and wire collaborators, checkers,
/// the verification service and the security monitor.
pub async fn assemble(config: &Config, shutdown: ShutdownSignal) -> anyhow::Result<Assembled> {
    let stores = open_stores(config).await?;

    let catalog = Arc::new(ZoneCatalog::new(stores.zones.clone()));
    catalog.load().await?;

    let metrics = Arc::new(MetricsRegistry::new());

    // Collaborators
    let endpoints = CollaboratorConfig::from_env();
    let client = reqwest::Client::builder()
        .timeout(endpoints.request_timeout)
        .build()?;
    let breakers = CircuitBreakerRegistry::new();
    let timeout = endpoints.request_timeout;

    let elevation = HttpCollaborator::new(
        "elevation",
        &endpoints.elevation_url,
        client.clone(),
        &breakers,
        timeout,
    )
    .await;
    let weather = HttpCollaborator::new(
        "weather",
        &endpoints.weather_url,
        client.clone(),
        &breakers,
        timeout,
    )
    .await
    .with_api_key(endpoints.weather_api_key.clone());
    let imagery = HttpCollaborator::new(
        "imagery",
        &endpoints.imagery_url,
        client.clone(),
        &breakers,
        timeout,
    )
    .await;
    let inference = HttpCollaborator::new(
        "inference",
        &endpoints.inference_url,
        client.clone(),
        &breakers,
        timeout,
    )
    .await;
    let storage = Arc::new(HttpPhotoStorage(
        HttpCollaborator::new(
            "storage",
            &endpoints.storage_url,
            client.clone(),
            &breakers,
            timeout,
        )
        .await,
    ));

    let rewards: Arc<dyn RewardIssuer> = match &endpoints.reward_webhook_url {
        Some(url) => Arc::new(WebhookRewardIssuer(
            HttpCollaborator::new("rewards", url, client.clone(), &breakers, timeout).await,
        )),
        None => {
            info!("REWARD_WEBHOOK_URL not set, reward notifications are only logged");
            Arc::new(LoggingRewardIssuer)
        }
    };
    let alerts: Arc<dyn AlertSink> = match &endpoints.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink(
            HttpCollaborator::new("alerts", url, client.clone(), &breakers, timeout).await,
        )),
        None => Arc::new(LoggingAlertSink),
    };

    // Security monitor
    let monitor = Arc::new(
        SecurityMonitor::new(
            MonitorConfig::from_env(),
            stores.security_events.clone(),
            alerts,
            metrics.clone(),
            stores.audit.clone(),
        )
        .with_default_detectors(Arc::new(InMemoryProfileStore::new())),
    );
    let (monitor_handle, monitor_task) = monitor.clone().spawn(shutdown);

    // Verification pipeline
    let duplicate = Arc::new(DuplicateDetector::new(
        DuplicateConfig::default(),
        storage.clone(),
        Arc::new(DctPerceptualHasher),
        stores.hash_index.clone(),
        stores.history.clone(),
    ));

    let mut builder = VerificationService::builder(PipelineConfig::from_env())
        .checker(Arc::new(GeospatialValidator::new(
            GeospatialConfig::default(),
            catalog.clone(),
            Arc::new(HttpElevationService(elevation)),
        )))
        .checker(Arc::new(TemporalChecker::new(TemporalConfig::default())))
        .checker(Arc::new(VegetationAnalyzer::new(
            VegetationConfig::default(),
            Arc::new(HttpImageryService(imagery)),
        )))
        .checker(Arc::new(PhotoAnalyzer::new(
            PhotoConfig::default(),
            storage,
            Arc::new(HttpInferenceService(inference)),
        )))
        .checker(Arc::new(WeatherChecker::new(
            WeatherConfig::default(),
            Arc::new(HttpWeatherService(weather)),
        )))
        .checker(duplicate.clone())
        .ledger(duplicate)
        .evidence_store(stores.evidence)
        .log_store(stores.logs)
        .rewards(rewards)
        .audit(stores.audit)
        .metrics(metrics.clone())
        .monitor(monitor_handle.clone());

    if let Some(url) = &endpoints.attestation_url {
        let source = HttpCollaborator::new("attestation", url, client, &breakers, timeout).await;
        builder = builder.community(Arc::new(CommunityAttestation::new(Arc::new(
            HttpAttestationSource(source),
        ))));
        info!("Community attestation enabled");
    }

    let service = Arc::new(builder.build()?);

    Ok(Assembled {
        state: AppState {
            service,
            monitor,
            monitor_handle: Some(monitor_handle),
            zones: catalog,
            metrics,
            health: stores.health,
        },
        monitor_task,
    })
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())?;

    info!("Starting planting verifier v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        backend = ?config.backend,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let Assembled {
        state,
        monitor_task,
    } = assemble(&config, coordinator.signal()).await?;

    let worker = RecheckWorker::new(state.service.clone());
    let worker_task = tokio::spawn(worker.run(coordinator.signal()));

    let app = build_router(state)?;

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.shutdown();
        });
    }

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("Planting verifier is ready to accept connections");
    serve_with_shutdown(
        listener,
        app,
        coordinator.clone(),
        GracefulShutdownConfig::default(),
    )
    .await?;

    // The listener only closes after shutdown was signalled.
    coordinator.shutdown();
    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "Re-check worker task failed");
    }
    if let Err(e) = monitor_task.await {
        tracing::error!(error = %e, "Security monitor task failed");
    }

    shutdown_telemetry();
    info!("Planting verifier stopped");
    Ok(())
}

/// Build the full router: `/api` routes with traffic observation, the
/// operational endpoints and HTTP tracing.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let api = crate::api::router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        crate::api::observe_traffic,
    ));

    let mut router = Router::new()
        .nest("/api", api)
        .merge(crate::api::ops_router())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let span = tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                );
                span.set_parent(extract_context_from_headers(request.headers()));
                span
            }),
        );

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router.with_state(state))
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
            ]),
    ))
}
