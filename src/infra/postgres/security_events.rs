//! PostgreSQL security event stream

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use uuid::Uuid;

use crate::domain::{SecurityEvent, SecurityEventType, Severity};
use crate::infra::{Result, SecurityEventStore, VerificationError};

pub struct PgSecurityEventStore {
    pool: PgPool,
}

impl PgSecurityEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete resolved events older than the retention period.
    pub async fn prune_resolved(&self, older_than_days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM security_events
            WHERE resolved AND timestamp < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    event_type: String,
    severity: String,
    source: String,
    target: Option<String>,
    description: String,
    metadata: Option<serde_json::Value>,
    resolved: bool,
}

impl TryFrom<EventRow> for SecurityEvent {
    type Error = VerificationError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            timestamp: row.timestamp,
            event_type: SecurityEventType::parse(&row.event_type),
            severity: row.severity.parse().map_err(VerificationError::Internal)?,
            source: row.source,
            target: row.target,
            description: row.description,
            metadata: row.metadata,
            resolved: row.resolved,
        })
    }
}

#[async_trait]
impl SecurityEventStore for PgSecurityEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_events (
                id, timestamp, event_type, severity, source, target,
                description, metadata, resolved
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(event.event_type.to_string())
        .bind(event.severity.as_str())
        .bind(&event.source)
        .bind(&event.target)
        .bind(&event.description)
        .bind(&event.metadata)
        .bind(event.resolved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        severity: Option<Severity>,
        limit: u32,
    ) -> Result<Vec<SecurityEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, timestamp, event_type, severity, source, target,
                   description, metadata, resolved
            FROM security_events
            WHERE timestamp >= $1
              AND ($2::text IS NULL OR severity = $2)
            ORDER BY timestamp DESC
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(severity.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SecurityEvent::try_from).collect()
    }

    async fn resolve(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE security_events SET resolved = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
