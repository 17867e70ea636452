//! PostgreSQL evidence store and append-only verification log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::{
    CheckResult, DecisionStatus, DeviceMetadata, EvidenceId, GeoPoint, ManualOverride,
    PendingVerification, Photo, PlanterId, PlantingEvidence, Rejection, SessionId,
    VerificationLog,
};
use crate::infra::{
    ComponentHealth, EvidenceStore, HealthCheck, Result, VerificationError, VerificationLogStore,
};

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// PostgreSQL-backed evidence and verification log storage
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct EvidenceRow {
    id: Uuid,
    planter_id: String,
    session_id: String,
    total_trees_claimed: i32,
    species: serde_json::Value,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PhotoRow {
    content_hash: String,
    lat: f64,
    lon: f64,
    captured_at: DateTime<Utc>,
    device_metadata: Option<serde_json::Value>,
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    evidence_id: Uuid,
    results: serde_json::Value,
    weighted_score: f64,
    participating_weight: f64,
    verified: bool,
    status: String,
    rejection: Option<serde_json::Value>,
    recommendations: serde_json::Value,
    manual_override: Option<serde_json::Value>,
    supersedes: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for VerificationLog {
    type Error = VerificationError;

    fn try_from(row: LogRow) -> Result<Self> {
        let status: DecisionStatus = row.status.parse().map_err(VerificationError::Internal)?;
        let results: Vec<CheckResult> = serde_json::from_value(row.results)?;
        let rejection: Option<Rejection> = row.rejection.map(serde_json::from_value).transpose()?;
        let manual_override: Option<ManualOverride> =
            row.manual_override.map(serde_json::from_value).transpose()?;

        Ok(Self {
            id: row.id,
            evidence_id: EvidenceId::from_uuid(row.evidence_id),
            results,
            weighted_score: row.weighted_score,
            participating_weight: row.participating_weight,
            verified: row.verified,
            status,
            rejection,
            recommendations: serde_json::from_value(row.recommendations)?,
            manual_override,
            supersedes: row.supersedes,
            created_at: row.created_at,
        })
    }
}

const LOG_COLUMNS: &str = "id, evidence_id, results, weighted_score, participating_weight, \
     verified, status, rejection, recommendations, manual_override, supersedes, created_at";

#[async_trait]
impl EvidenceStore for PgStore {
    async fn insert(&self, evidence: &PlantingEvidence) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO planting_evidence (
                id, planter_id, session_id, total_trees_claimed, species, submitted_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(evidence.id.0)
        .bind(evidence.planter_id.as_str())
        .bind(evidence.session_id.as_str())
        .bind(evidence.total_trees_claimed as i32)
        .bind(serde_json::to_value(&evidence.species)?)
        .bind(evidence.submitted_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(e) if is_unique_violation(&e) => {
                return Err(VerificationError::DuplicateEvidence(evidence.id))
            }
            other => {
                other?;
            }
        }

        for (position, photo) in evidence.photos.iter().enumerate() {
            let device_metadata = photo
                .device_metadata
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO planting_photos (
                    evidence_id, position, content_hash, lat, lon, captured_at, device_metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(evidence.id.0)
            .bind(position as i32)
            .bind(&photo.content_hash)
            .bind(photo.location.lat)
            .bind(photo.location.lon)
            .bind(photo.captured_at)
            .bind(device_metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: EvidenceId) -> Result<Option<PlantingEvidence>> {
        let row = sqlx::query_as::<_, EvidenceRow>(
            r#"
            SELECT id, planter_id, session_id, total_trees_claimed, species, submitted_at
            FROM planting_evidence
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let photos = sqlx::query_as::<_, PhotoRow>(
            r#"
            SELECT content_hash, lat, lon, captured_at, device_metadata
            FROM planting_photos
            WHERE evidence_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|p| {
            let device_metadata: Option<DeviceMetadata> =
                p.device_metadata.map(serde_json::from_value).transpose()?;
            Ok(Photo {
                content_hash: p.content_hash,
                location: GeoPoint::new(p.lat, p.lon),
                captured_at: p.captured_at,
                device_metadata,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let species: BTreeSet<String> = serde_json::from_value(row.species)?;
        Ok(Some(PlantingEvidence {
            id: EvidenceId::from_uuid(row.id),
            planter_id: PlanterId::new(row.planter_id),
            session_id: SessionId::new(row.session_id),
            total_trees_claimed: row.total_trees_claimed.max(0) as u32,
            species,
            photos,
            submitted_at: row.submitted_at,
        }))
    }

    async fn list_pending(&self, limit: u32, offset: u32) -> Result<Vec<PendingVerification>> {
        let rows: Vec<(Uuid, String, i32, i64, DateTime<Utc>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT e.id, e.planter_id, e.total_trees_claimed,
                   (SELECT COUNT(*) FROM planting_photos p WHERE p.evidence_id = e.id),
                   e.submitted_at, l.status
            FROM planting_evidence e
            LEFT JOIN LATERAL (
                SELECT status FROM verification_logs v
                WHERE v.evidence_id = e.id
                ORDER BY v.seq DESC
                LIMIT 1
            ) l ON TRUE
            WHERE l.status IS NULL OR l.status = 'pending'
            ORDER BY e.submitted_at ASC, e.id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, planter, trees, photos, submitted_at, status)| {
                let last_status = status
                    .map(|s| s.parse::<DecisionStatus>())
                    .transpose()
                    .map_err(VerificationError::Internal)?;
                Ok(PendingVerification {
                    evidence_id: EvidenceId::from_uuid(id),
                    planter_id: PlanterId::new(planter),
                    total_trees_claimed: trees.max(0) as u32,
                    photo_count: photos.max(0) as u32,
                    submitted_at,
                    last_status,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VerificationLogStore for PgStore {
    async fn append(&self, log: &VerificationLog) -> Result<()> {
        let rejection = log.rejection.as_ref().map(serde_json::to_value).transpose()?;
        let manual_override = log
            .manual_override
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO verification_logs (
                id, evidence_id, results, weighted_score, participating_weight,
                verified, status, rejection, recommendations, manual_override,
                supersedes, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(log.id)
        .bind(log.evidence_id.0)
        .bind(serde_json::to_value(&log.results)?)
        .bind(log.weighted_score)
        .bind(log.participating_weight)
        .bind(log.verified)
        .bind(log.status.as_str())
        .bind(rejection)
        .bind(serde_json::to_value(&log.recommendations)?)
        .bind(manual_override)
        .bind(log.supersedes)
        .bind(log.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(VerificationError::InitialLogExists(log.evidence_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, evidence_id: EvidenceId) -> Result<Option<VerificationLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM verification_logs \
             WHERE evidence_id = $1 ORDER BY seq DESC LIMIT 1"
        );
        sqlx::query_as::<_, LogRow>(&sql)
            .bind(evidence_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(VerificationLog::try_from)
            .transpose()
    }

    async fn history(&self, evidence_id: EvidenceId) -> Result<Vec<VerificationLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM verification_logs \
             WHERE evidence_id = $1 ORDER BY seq ASC"
        );
        sqlx::query_as::<_, LogRow>(&sql)
            .bind(evidence_id.0)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(VerificationLog::try_from)
            .collect()
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn ping(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => ComponentHealth::Healthy,
            Err(e) => ComponentHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}
