//! Audit logging for decisions and admin operations
//!
//! Every automated decision, manual override, zone change and security event
//! resolution is written here in addition to its primary table, so reviewers
//! get one chronological trail with actor attribution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{AuditSink, Result};

/// Audit log action types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Verification
    EvidenceSubmitted,
    VerificationDecided,
    VerificationOverridden,
    PendingRechecked,

    // Zone catalog
    ZoneUpserted,

    // Security stream
    SecurityEventResolved,
    AlertRaised,

    // Other
    Custom(String),
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::EvidenceSubmitted => write!(f, "evidence_submitted"),
            AuditAction::VerificationDecided => write!(f, "verification_decided"),
            AuditAction::VerificationOverridden => write!(f, "verification_overridden"),
            AuditAction::PendingRechecked => write!(f, "pending_rechecked"),
            AuditAction::ZoneUpserted => write!(f, "zone_upserted"),
            AuditAction::SecurityEventResolved => write!(f, "security_event_resolved"),
            AuditAction::AlertRaised => write!(f, "alert_raised"),
            AuditAction::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique audit log ID
    pub id: Uuid,
    /// When the action occurred
    pub timestamp: DateTime<Utc>,
    /// The action that was performed
    pub action: AuditAction,
    /// Actor who performed the action (admin id, planter id, `system`)
    pub actor: String,
    /// Actor type (admin, planter, system)
    pub actor_type: String,
    /// Resource type that was affected
    pub resource_type: Option<String>,
    /// Resource ID that was affected
    pub resource_id: Option<String>,
    /// Additional details as JSON
    pub details: Option<serde_json::Value>,
    /// Whether the action succeeded
    pub success: bool,
    /// Error message if failed
    pub error_message: Option<String>,
}

/// Builder for creating audit log entries
pub struct AuditLogBuilder {
    action: AuditAction,
    actor: String,
    actor_type: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    details: Option<serde_json::Value>,
    success: bool,
    error_message: Option<String>,
}

impl AuditLogBuilder {
    pub fn new(action: AuditAction, actor: impl Into<String>, actor_type: impl Into<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            actor_type: actor_type.into(),
            resource_type: None,
            resource_id: None,
            details: None,
            success: true,
            error_message: None,
        }
    }

    /// Entry attributed to the pipeline itself.
    pub fn system(action: AuditAction) -> Self {
        Self::new(action, "system", "system")
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn build(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: self.action,
            actor: self.actor,
            actor_type: self.actor_type,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            details: self.details,
            success: self.success,
            error_message: self.error_message,
        }
    }
}

/// Query filters for audit logs
#[derive(Debug, Clone, Default)]
pub struct AuditQueryFilters {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQueryFilters {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor.as_ref().map_or(true, |a| &entry.actor == a)
            && self.action.as_ref().map_or(true, |a| &entry.action == a)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |t| entry.resource_type.as_ref() == Some(t))
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| entry.resource_id.as_ref() == Some(r))
            && self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
    }
}

fn emit_trace(entry: &AuditLogEntry) {
    if entry.success {
        tracing::info!(
            action = %entry.action,
            actor = %entry.actor,
            actor_type = %entry.actor_type,
            resource_type = ?entry.resource_type,
            resource_id = ?entry.resource_id,
            "Audit log entry"
        );
    } else {
        tracing::warn!(
            action = %entry.action,
            actor = %entry.actor,
            actor_type = %entry.actor_type,
            error = ?entry.error_message,
            "Audit log entry (failed)"
        );
    }
}

/// PostgreSQL-backed audit logger
pub struct PgAuditLogger {
    pool: PgPool,
}

impl PgAuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete entries older than the retention window.
    pub async fn cleanup(&self, older_than_days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM audit_log
            WHERE timestamp < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted = deleted, "Cleaned up old audit log entries");
        }

        Ok(deleted)
    }
}

#[async_trait]
impl AuditSink for PgAuditLogger {
    async fn record(&self, entry: AuditLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, timestamp, action, actor, actor_type,
                resource_type, resource_id, details, success, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(entry.action.to_string())
        .bind(&entry.actor)
        .bind(&entry.actor_type)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.details)
        .bind(entry.success)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;

        emit_trace(&entry);
        Ok(())
    }

    async fn query(&self, filters: AuditQueryFilters) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            r#"
            SELECT id, timestamp, action, actor, actor_type,
                   resource_type, resource_id, details, success, error_message
            FROM audit_log
            WHERE ($1::text IS NULL OR actor = $1)
              AND ($2::text IS NULL OR action = $2)
              AND ($3::text IS NULL OR resource_type = $3)
              AND ($4::text IS NULL OR resource_id = $4)
              AND ($5::timestamptz IS NULL OR timestamp >= $5)
              AND ($6::timestamptz IS NULL OR timestamp <= $6)
            ORDER BY timestamp DESC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(&filters.actor)
        .bind(filters.action.as_ref().map(|a| a.to_string()))
        .bind(&filters.resource_type)
        .bind(&filters.resource_id)
        .bind(filters.from)
        .bind(filters.to)
        .bind(filters.limit.unwrap_or(100))
        .bind(filters.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AuditLogEntry::from).collect())
    }
}

/// In-memory audit log for tests and `STORAGE_BACKEND=memory`
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: tokio::sync::RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, entry: AuditLogEntry) -> Result<()> {
        emit_trace(&entry);
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn query(&self, filters: AuditQueryFilters) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        let offset = filters.offset.unwrap_or(0).max(0) as usize;
        let limit = filters.limit.unwrap_or(100).max(0) as usize;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filters.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Database row for audit log
#[derive(Debug, sqlx::FromRow)]
struct AuditLogRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    action: String,
    actor: String,
    actor_type: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    details: Option<serde_json::Value>,
    success: bool,
    error_message: Option<String>,
}

impl From<AuditLogRow> for AuditLogEntry {
    fn from(row: AuditLogRow) -> Self {
        Self {
            id: row.id,
            timestamp: row.timestamp,
            action: parse_audit_action(&row.action),
            actor: row.actor,
            actor_type: row.actor_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            details: row.details,
            success: row.success,
            error_message: row.error_message,
        }
    }
}

fn parse_audit_action(s: &str) -> AuditAction {
    match s {
        "evidence_submitted" => AuditAction::EvidenceSubmitted,
        "verification_decided" => AuditAction::VerificationDecided,
        "verification_overridden" => AuditAction::VerificationOverridden,
        "pending_rechecked" => AuditAction::PendingRechecked,
        "zone_upserted" => AuditAction::ZoneUpserted,
        "security_event_resolved" => AuditAction::SecurityEventResolved,
        "alert_raised" => AuditAction::AlertRaised,
        s if s.starts_with("custom:") => AuditAction::Custom(s[7..].to_string()),
        _ => AuditAction::Custom(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_round_trip() {
        for action in [
            AuditAction::VerificationOverridden,
            AuditAction::ZoneUpserted,
            AuditAction::Custom("threshold_tuned".into()),
        ] {
            assert_eq!(parse_audit_action(&action.to_string()), action);
        }
    }

    #[tokio::test]
    async fn in_memory_query_filters_newest_first() {
        let log = InMemoryAuditLog::new();
        log.record(
            AuditLogBuilder::new(AuditAction::VerificationOverridden, "admin-1", "admin")
                .resource("evidence", "e-1")
                .build(),
        )
        .await
        .unwrap();
        log.record(
            AuditLogBuilder::system(AuditAction::VerificationDecided)
                .resource("evidence", "e-2")
                .build(),
        )
        .await
        .unwrap();

        let overrides = log
            .query(AuditQueryFilters {
                action: Some(AuditAction::VerificationOverridden),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].actor, "admin-1");

        let all = log.query(AuditQueryFilters::default()).await.unwrap();
        assert_eq!(all[0].resource_id.as_deref(), Some("e-2"));
    }
}
