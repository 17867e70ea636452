//! The append-only verification log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{AdminId, CheckResult, CheckerKind, EvidenceId};

/// Current decision for a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Verified,
    Rejected,
    Pending,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Verified => "verified",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Pending => "pending",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, DecisionStatus::Pending)
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(DecisionStatus::Verified),
            "rejected" => Ok(DecisionStatus::Rejected),
            "pending" => Ok(DecisionStatus::Pending),
            other => Err(format!("unknown decision status: {other}")),
        }
    }
}

/// Category of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    /// An authoritative checker explicitly failed.
    HardReject,
    /// The weighted score stayed below the threshold.
    LowScore,
    /// Ambiguous zones or malformed evidence; routed to data-quality review.
    ConfigError,
    /// Decided by an administrator.
    ManualReview,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::HardReject => "hard_reject",
            RejectionCode::LowScore => "low_score",
            RejectionCode::ConfigError => "config_error",
            RejectionCode::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectionCode,
    pub reason: String,
}

/// Admin decision layered on top of an automated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub admin_id: AdminId,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_trees: Option<u32>,
}

/// One immutable row of the verification history.
///
/// Rows are never edited. An override or a pending re-check appends a new row
/// whose `supersedes` points at the row it replaces; the current decision is
/// always the newest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationLog {
    pub id: Uuid,
    pub evidence_id: EvidenceId,
    pub results: Vec<CheckResult>,
    pub weighted_score: f64,
    /// Sum of the weights of checkers that returned a definite result.
    pub participating_weight: f64,
    pub verified: bool,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl VerificationLog {
    pub fn result(&self, checker: CheckerKind) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.checker == checker)
    }

    /// Per-checker details keyed by checker name.
    pub fn details(&self) -> serde_json::Value {
        let map = self
            .results
            .iter()
            .map(|r| (r.checker.as_str().to_string(), r.details.clone()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    pub fn is_override(&self) -> bool {
        self.manual_override.is_some()
    }

    /// Build the override row that supersedes `prior`.
    pub fn override_of(
        prior: &VerificationLog,
        verified: bool,
        manual_override: ManualOverride,
    ) -> Self {
        let (status, rejection) = if verified {
            (DecisionStatus::Verified, None)
        } else {
            (
                DecisionStatus::Rejected,
                Some(Rejection {
                    code: RejectionCode::ManualReview,
                    reason: manual_override.reason.clone(),
                }),
            )
        };

        Self {
            id: Uuid::new_v4(),
            evidence_id: prior.evidence_id,
            results: prior.results.clone(),
            weighted_score: prior.weighted_score,
            participating_weight: prior.participating_weight,
            verified,
            status,
            rejection,
            recommendations: Vec::new(),
            manual_override: Some(manual_override),
            supersedes: Some(prior.id),
            created_at: Utc::now(),
        }
    }
}

/// Evidence awaiting a decision, as listed for reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub evidence_id: EvidenceId,
    pub planter_id: super::PlanterId,
    pub total_trees_claimed: u32,
    pub photo_count: u32,
    pub submitted_at: DateTime<Utc>,
    /// `None` when no automated run has happened yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<DecisionStatus>,
}

/// A planting that passed verification, used for location redundancy checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPlanting {
    pub evidence_id: EvidenceId,
    pub planter_id: super::PlanterId,
    pub location: super::GeoPoint,
    pub trees: u32,
    pub planted_at: DateTime<Utc>,
    pub verified_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn automated() -> VerificationLog {
        VerificationLog {
            id: Uuid::new_v4(),
            evidence_id: EvidenceId::new(),
            results: vec![CheckResult::pass(
                CheckerKind::Satellite,
                0.3,
                json!({ "reason": "insufficient satellite data" }),
            )],
            weighted_score: 0.6,
            participating_weight: 0.75,
            verified: false,
            status: DecisionStatus::Rejected,
            rejection: Some(Rejection {
                code: RejectionCode::LowScore,
                reason: "score below threshold".into(),
            }),
            recommendations: vec![],
            manual_override: None,
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn override_row_references_prior() {
        let prior = automated();
        let row = VerificationLog::override_of(
            &prior,
            true,
            ManualOverride {
                admin_id: AdminId::new("admin-1"),
                reason: "manual field check".into(),
                adjusted_trees: Some(42),
            },
        );

        assert_eq!(row.supersedes, Some(prior.id));
        assert_eq!(row.status, DecisionStatus::Verified);
        assert!(row.rejection.is_none());
        assert_eq!(row.evidence_id, prior.evidence_id);
    }

    #[test]
    fn details_are_keyed_by_checker_name() {
        let log = automated();
        assert_eq!(
            log.details()["satellite"]["reason"],
            "insufficient satellite data"
        );
    }
}
