//! PostgreSQL fingerprint index and verified planting history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::{EvidenceId, GeoPoint, PerceptualHash, PlanterId, VerifiedPlanting};
use crate::geo::{haversine_m, BoundingBox};
use crate::infra::{HashEntry, HashIndex, HashMatch, PlantingHistory, Result};

/// Fingerprints stored as BIGINT with the bits of the u64 preserved.
pub struct PgHashIndex {
    pool: PgPool,
}

impl PgHashIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type HashRow = (i64, i64, Uuid, String, DateTime<Utc>);

fn to_match((query, hash, evidence_id, planter_id, recorded_at): HashRow) -> HashMatch {
    let query = PerceptualHash::from_i64(query);
    let hash = PerceptualHash::from_i64(hash);
    HashMatch {
        query,
        distance: query.distance(&hash),
        existing: HashEntry {
            hash,
            evidence_id: EvidenceId::from_uuid(evidence_id),
            planter_id: PlanterId::new(planter_id),
            recorded_at,
        },
    }
}

#[async_trait]
impl HashIndex for PgHashIndex {
    async fn find_matches(
        &self,
        queries: &[PerceptualHash],
        exclude_planter: &PlanterId,
        max_distance: u32,
    ) -> Result<Vec<HashMatch>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let queries: Vec<i64> = queries.iter().map(PerceptualHash::as_i64).collect();

        let rows: Vec<HashRow> = if max_distance == 0 {
            sqlx::query_as(
                r#"
                SELECT h.hash, h.hash, h.evidence_id, h.planter_id, h.recorded_at
                FROM photo_hashes h
                WHERE h.hash = ANY($1) AND h.planter_id <> $2
                "#,
            )
            .bind(&queries)
            .bind(exclude_planter.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT q.hash, h.hash, h.evidence_id, h.planter_id, h.recorded_at
                FROM UNNEST($1::bigint[]) AS q(hash)
                JOIN photo_hashes h
                  ON bit_count((h.hash # q.hash)::bit(64)) <= $3
                WHERE h.planter_id <> $2
                "#,
            )
            .bind(&queries)
            .bind(exclude_planter.as_str())
            .bind(i64::from(max_distance))
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(to_match).collect())
    }

    async fn claim_all(&self, entries: &[HashEntry]) -> Result<Vec<HashEntry>> {
        // Sorted inserts keep two overlapping batches from deadlocking.
        let mut ordered: Vec<&HashEntry> = entries.iter().collect();
        ordered.sort_by_key(|entry| entry.hash.as_i64());
        ordered.dedup_by_key(|entry| entry.hash);

        let mut tx = self.pool.begin().await?;
        let mut conflicts = Vec::new();
        for entry in ordered {
            let inserted = sqlx::query(
                r#"
                INSERT INTO photo_hashes (hash, evidence_id, planter_id, recorded_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (hash) DO NOTHING
                "#,
            )
            .bind(entry.hash.as_i64())
            .bind(entry.evidence_id.0)
            .bind(entry.planter_id.as_str())
            .bind(entry.recorded_at)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 1 {
                continue;
            }

            let (evidence_id, planter_id, recorded_at): (Uuid, String, DateTime<Utc>) =
                sqlx::query_as(
                    "SELECT evidence_id, planter_id, recorded_at FROM photo_hashes WHERE hash = $1",
                )
                .bind(entry.hash.as_i64())
                .fetch_one(&mut *tx)
                .await?;
            if planter_id != entry.planter_id.as_str() {
                conflicts.push(HashEntry {
                    hash: entry.hash,
                    evidence_id: EvidenceId::from_uuid(evidence_id),
                    planter_id: PlanterId::new(planter_id),
                    recorded_at,
                });
            }
        }

        if conflicts.is_empty() {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(conflicts)
    }
}

/// Verified plantings; radius queries prefilter on a bounding box in SQL.
pub struct PgPlantingHistory {
    pool: PgPool,
}

impl PgPlantingHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlantingHistory for PgPlantingHistory {
    async fn recent_nearby(
        &self,
        planter_id: &PlanterId,
        location: GeoPoint,
        radius_m: f64,
        since: DateTime<Utc>,
    ) -> Result<Vec<VerifiedPlanting>> {
        let bbox = BoundingBox::around(&location, radius_m);
        let rows: Vec<(Uuid, f64, f64, i32, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT evidence_id, lat, lon, trees, planted_at, verified_at
            FROM verified_plantings
            WHERE planter_id = $1
              AND planted_at >= $2
              AND lat BETWEEN $3 AND $4
              AND lon BETWEEN $5 AND $6
            ORDER BY planted_at DESC
            "#,
        )
        .bind(planter_id.as_str())
        .bind(since)
        .bind(bbox.south)
        .bind(bbox.north)
        .bind(bbox.west)
        .bind(bbox.east)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(evidence_id, lat, lon, trees, planted_at, verified_at)| VerifiedPlanting {
                evidence_id: EvidenceId::from_uuid(evidence_id),
                planter_id: planter_id.clone(),
                location: GeoPoint::new(lat, lon),
                trees: trees.max(0) as u32,
                planted_at,
                verified_at,
            })
            .filter(|p| haversine_m(&p.location, &location) <= radius_m)
            .collect())
    }

    async fn record(&self, planting: &VerifiedPlanting) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verified_plantings (
                evidence_id, planter_id, lat, lon, trees, planted_at, verified_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (evidence_id) DO NOTHING
            "#,
        )
        .bind(planting.evidence_id.0)
        .bind(planting.planter_id.as_str())
        .bind(planting.location.lat)
        .bind(planting.location.lon)
        .bind(planting.trees as i32)
        .bind(planting.planted_at)
        .bind(planting.verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
