//! PostgreSQL zone catalog persistence

use async_trait::async_trait;
use sqlx::{postgres::PgPool, FromRow};

use crate::domain::{ElevationRange, PlantingZone};
use crate::infra::{Result, ZoneStore};

pub struct PgZoneStore {
    pool: PgPool,
}

impl PgZoneStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ZoneRow {
    id: String,
    name: String,
    polygon: serde_json::Value,
    elevation_min: f64,
    elevation_max: f64,
    optimal_species: serde_json::Value,
    active: bool,
    restrictions: serde_json::Value,
}

impl TryFrom<ZoneRow> for PlantingZone {
    type Error = serde_json::Error;

    fn try_from(row: ZoneRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            polygon: serde_json::from_value(row.polygon)?,
            elevation_range: ElevationRange {
                min: row.elevation_min,
                max: row.elevation_max,
            },
            optimal_species: serde_json::from_value(row.optimal_species)?,
            active: row.active,
            restrictions: serde_json::from_value(row.restrictions)?,
        })
    }
}

#[async_trait]
impl ZoneStore for PgZoneStore {
    async fn list(&self) -> Result<Vec<PlantingZone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            r#"
            SELECT id, name, polygon, elevation_min, elevation_max,
                   optimal_species, active, restrictions
            FROM planting_zones
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut zones = Vec::with_capacity(rows.len());
        for row in rows {
            zones.push(PlantingZone::try_from(row)?);
        }
        Ok(zones)
    }

    async fn upsert(&self, zone: &PlantingZone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO planting_zones (
                id, name, polygon, elevation_min, elevation_max,
                optimal_species, active, restrictions, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                polygon = EXCLUDED.polygon,
                elevation_min = EXCLUDED.elevation_min,
                elevation_max = EXCLUDED.elevation_max,
                optimal_species = EXCLUDED.optimal_species,
                active = EXCLUDED.active,
                restrictions = EXCLUDED.restrictions,
                updated_at = NOW()
            "#,
        )
        .bind(&zone.id)
        .bind(&zone.name)
        .bind(serde_json::to_value(&zone.polygon)?)
        .bind(zone.elevation_range.min)
        .bind(zone.elevation_range.max)
        .bind(serde_json::to_value(&zone.optimal_species)?)
        .bind(zone.active)
        .bind(serde_json::to_value(&zone.restrictions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
