//! Shared request and response types for REST API handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AdminId, DecisionStatus, EvidenceId, OperationalEvent, PendingVerification, PlantingEvidence,
    SecurityEvent, VerificationLog,
};
use crate::pipeline::OverrideRequest;

// ============================================================================
// Evidence types
// ============================================================================

/// Response for an accepted submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEvidenceResponse {
    pub evidence_id: EvidenceId,
    pub photo_count: usize,
    pub submitted_at: DateTime<Utc>,
}

impl From<&PlantingEvidence> for SubmitEvidenceResponse {
    fn from(evidence: &PlantingEvidence) -> Self {
        Self {
            evidence_id: evidence.id,
            photo_count: evidence.photos.len(),
            submitted_at: evidence.submitted_at,
        }
    }
}

/// Full verification history for one submission, oldest row first.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogHistoryResponse {
    pub evidence_id: EvidenceId,
    pub current_status: Option<DecisionStatus>,
    pub logs: Vec<VerificationLog>,
    pub count: usize,
}

impl LogHistoryResponse {
    pub fn new(evidence_id: EvidenceId, logs: Vec<VerificationLog>) -> Self {
        Self {
            evidence_id,
            current_status: logs.last().map(|l| l.status),
            count: logs.len(),
            logs,
        }
    }
}

// ============================================================================
// Admin types
// ============================================================================

/// Body of `POST /api/v1/admin/evidence/:id/override`; the evidence id comes
/// from the path.
#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub verified: bool,
    pub reason: String,
    #[serde(default)]
    pub adjusted_trees: Option<u32>,
    pub admin_id: String,
}

impl OverrideBody {
    pub fn into_request(self, evidence_id: EvidenceId) -> OverrideRequest {
        OverrideRequest {
            evidence_id,
            verified: self.verified,
            reason: self.reason,
            adjusted_trees: self.adjusted_trees,
            admin_id: AdminId::new(self.admin_id),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub items: Vec<PendingVerification>,
    pub count: usize,
    pub limit: u32,
    pub offset: u32,
}

// ============================================================================
// Security types
// ============================================================================

/// Batch of operational events for the monitor.
#[derive(Debug, Deserialize)]
pub struct IngestEventsRequest {
    pub events: Vec<OperationalEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestEventsResponse {
    pub accepted: usize,
    pub failed: usize,
    /// Security events raised while processing the batch.
    pub security_events: Vec<SecurityEvent>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityEventsQuery {
    pub since: Option<DateTime<Utc>>,
    pub severity: Option<String>,
    pub limit: Option<u32>,
}
