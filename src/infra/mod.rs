//! Infrastructure layer for the planting verifier
//!
//! Contains trait definitions and implementations for:
//! - Evidence, verification log, zone and security event storage (PostgreSQL, in-memory)
//! - Fingerprint index and verified planting history
//! - HTTP clients for the external collaborators
//! - Circuit breaker and retry (collaborator protection)
//! - Caching (in-memory LRU)
//! - Graceful shutdown
//! - Audit logging (decisions and admin operations)

mod audit;
pub mod cache;
mod circuit_breaker;
mod error;
mod graceful_shutdown;
mod http_clients;
pub mod memory;
pub mod postgres;
mod retry;
mod traits;

pub use audit::{
    AuditAction, AuditLogBuilder, AuditLogEntry, AuditQueryFilters, InMemoryAuditLog,
    PgAuditLogger,
};
pub use cache::{CacheStats, LruCache};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use error::*;
pub use graceful_shutdown::{
    serve_with_shutdown, shutdown_signal, spawn_until_shutdown, GracefulShutdownConfig,
    ShutdownCoordinator, ShutdownSignal,
};
pub use http_clients::{
    CollaboratorConfig, HttpAttestationSource, HttpCollaborator, HttpElevationService,
    HttpImageryService, HttpInferenceService, HttpPhotoStorage, HttpWeatherService,
    LoggingAlertSink, LoggingRewardIssuer, WebhookAlertSink, WebhookRewardIssuer,
};
pub use memory::{
    InMemoryHashIndex, InMemoryPlantingHistory, InMemorySecurityEventStore, InMemoryStore,
    InMemoryZoneStore,
};
pub use postgres::{PgHashIndex, PgPlantingHistory, PgSecurityEventStore, PgStore, PgZoneStore};
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use traits::*;
