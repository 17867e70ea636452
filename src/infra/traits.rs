//! Trait definitions for the verifier's collaborators and stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Attestation, DateRange, EvidenceId, GeoPoint, Imagery, PendingVerification, PerceptualHash,
    PhotoAssessment, PlanterId, PlantingEvidence, PlantingZone, SecurityEvent, Severity,
    VegetationChange, VerificationLog, VerifiedPlanting, WeatherConditions,
};

use super::audit::{AuditLogEntry, AuditQueryFilters};
use super::Result;

// ============================================================================
// External collaborators
// ============================================================================

/// Satellite imagery search and vegetation-index comparison.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageryService: Send + Sync {
    /// Scenes covering `location` inside `window` with at most
    /// `max_cloud_cover` percent cloud.
    async fn search_imagery(
        &self,
        location: GeoPoint,
        window: DateRange,
        max_cloud_cover: f64,
    ) -> Result<Vec<Imagery>>;

    /// Vegetation change between two scenes.
    async fn analyze_vegetation_change(
        &self,
        location: GeoPoint,
        before: &Imagery,
        after: &Imagery,
    ) -> Result<VegetationChange>;
}

/// Tree detection, species classification and image quality scoring.
///
/// The pipeline only consumes inference output; any conforming runtime
/// (remote, local, mocked) plugs in here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn detect_trees(&self, image: &[u8]) -> Result<u32>;

    async fn classify_species(&self, image: &[u8]) -> Result<Vec<String>>;

    /// Health/quality scores and anomaly tags (`fake_trees`, ...).
    async fn assess_photo(&self, image: &[u8]) -> Result<PhotoAssessment>;
}

/// Historical weather lookup.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WeatherService: Send + Sync {
    async fn get_conditions(&self, location: GeoPoint, at: DateTime<Utc>)
        -> Result<WeatherConditions>;
}

/// Terrain elevation lookup.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ElevationService: Send + Sync {
    /// Metres above sea level.
    async fn get_elevation(&self, location: GeoPoint) -> Result<f64>;
}

/// Photo byte retrieval. Content addressing is opaque to the verifier.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PhotoStorage: Send + Sync {
    async fn get_bytes(&self, content_hash: &str) -> Result<Vec<u8>>;
}

/// Downstream reward issuance. Notified after a verified decision; the
/// pipeline never waits on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RewardIssuer: Send + Sync {
    async fn on_verified(
        &self,
        evidence_id: EvidenceId,
        planter_id: &PlanterId,
        trees_verified: u32,
    ) -> Result<()>;
}

/// External paging/notification sink for security alerts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise_alert(&self, event: &SecurityEvent) -> Result<()>;
}

/// Community coordinator attestations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttestationSource: Send + Sync {
    async fn attestation_for(&self, evidence_id: EvidenceId) -> Result<Option<Attestation>>;
}

// ============================================================================
// Stores
// ============================================================================

/// Submitted evidence.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Persist a new submission. Fails with `DuplicateEvidence` if the id exists.
    async fn insert(&self, evidence: &PlantingEvidence) -> Result<()>;

    async fn get(&self, id: EvidenceId) -> Result<Option<PlantingEvidence>>;

    /// Evidence with no log yet or whose newest log is pending, oldest first.
    async fn list_pending(&self, limit: u32, offset: u32) -> Result<Vec<PendingVerification>>;
}

/// Append-only verification history.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VerificationLogStore: Send + Sync {
    async fn append(&self, log: &VerificationLog) -> Result<()>;

    /// Newest row for the evidence.
    async fn latest(&self, evidence_id: EvidenceId) -> Result<Option<VerificationLog>>;

    /// All rows, oldest first.
    async fn history(&self, evidence_id: EvidenceId) -> Result<Vec<VerificationLog>>;
}

/// A fingerprint owned by a verified submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub hash: PerceptualHash,
    pub evidence_id: EvidenceId,
    pub planter_id: PlanterId,
    pub recorded_at: DateTime<Utc>,
}

/// A queried fingerprint that matched an indexed fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMatch {
    pub query: PerceptualHash,
    pub existing: HashEntry,
    pub distance: u32,
}

/// Fingerprint index of verified photos.
///
/// Reads are lock-free with respect to each other. `claim_all` is atomic
/// across the whole batch, so two concurrent submissions cannot both take
/// the same fingerprint and a rejected batch leaves nothing behind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HashIndex: Send + Sync {
    /// Indexed fingerprints within `max_distance` of any query hash, excluding
    /// those owned by `exclude_planter`.
    async fn find_matches(
        &self,
        queries: &[PerceptualHash],
        exclude_planter: &PlanterId,
        max_distance: u32,
    ) -> Result<Vec<HashMatch>>;

    /// Claim every entry or none of them. Returns the entries already owned
    /// by another planter; when that list is non-empty nothing was inserted.
    /// Hashes the same planter already holds are neither inserted nor
    /// conflicts.
    async fn claim_all(&self, entries: &[HashEntry]) -> Result<Vec<HashEntry>>;
}

/// Verified planting locations for redundancy checks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlantingHistory: Send + Sync {
    /// The planter's verified plantings within `radius_m` of `location` since
    /// `since`.
    async fn recent_nearby(
        &self,
        planter_id: &PlanterId,
        location: GeoPoint,
        radius_m: f64,
        since: DateTime<Utc>,
    ) -> Result<Vec<VerifiedPlanting>>;

    async fn record(&self, planting: &VerifiedPlanting) -> Result<()>;
}

/// Persisted zone catalog.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ZoneStore: Send + Sync {
    async fn list(&self) -> Result<Vec<PlantingZone>>;

    async fn upsert(&self, zone: &PlantingZone) -> Result<()>;
}

/// Append-only security event stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecurityEventStore: Send + Sync {
    async fn append(&self, event: &SecurityEvent) -> Result<()>;

    /// Events at or after `since`, newest first, optionally filtered by
    /// severity.
    async fn since(
        &self,
        since: DateTime<Utc>,
        severity: Option<Severity>,
        limit: u32,
    ) -> Result<Vec<SecurityEvent>>;

    /// Mark resolved. Returns false when the id is unknown.
    async fn resolve(&self, id: Uuid) -> Result<bool>;
}

/// Administrative audit trail.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditLogEntry) -> Result<()>;

    async fn query(&self, filters: AuditQueryFilters) -> Result<Vec<AuditLogEntry>>;
}

// ============================================================================
// Health
// ============================================================================

/// Health check for components
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub database: ComponentHealth,
    pub zone_catalog: ComponentHealth,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        !self.database.is_unhealthy() && !self.zone_catalog.is_unhealthy()
    }
}

/// Individual component health
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentHealth::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, ComponentHealth::Unhealthy { .. })
    }
}

/// Storage backend liveness check
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self) -> ComponentHealth;
}
