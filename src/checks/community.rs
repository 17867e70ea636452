//! Optional coordinator attestation.
//!
//! Not a [`Checker`](super::Checker): it only contributes when an
//! attestation exists, and its absence leaves the weight out entirely.

use std::sync::Arc;

use serde_json::json;

use crate::domain::{CheckResult, CheckerKind, PlantingEvidence};
use crate::infra::{AttestationSource, Result};

pub struct CommunityAttestation {
    source: Arc<dyn AttestationSource>,
}

impl CommunityAttestation {
    pub fn new(source: Arc<dyn AttestationSource>) -> Self {
        Self { source }
    }

    /// `None` when no coordinator has attested this evidence.
    pub async fn attest(&self, evidence: &PlantingEvidence) -> Result<Option<CheckResult>> {
        let Some(attestation) = self.source.attestation_for(evidence.id).await? else {
            return Ok(None);
        };

        let passed = attestation.approved && attestation.signature_valid;
        let confidence = if attestation.signature_valid { 0.9 } else { 0.3 };
        let details = json!({
            "coordinator_id": attestation.coordinator_id,
            "approved": attestation.approved,
            "signature_valid": attestation.signature_valid,
            "notes": attestation.notes,
        });

        Ok(Some(if passed {
            CheckResult::pass(CheckerKind::Community, confidence, details)
        } else {
            CheckResult::fail(CheckerKind::Community, confidence, details)
        }))
    }
}
