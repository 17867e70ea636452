//! Submission intake: shape validation before evidence is stored.
//!
//! Rejections here are data-quality problems (`MalformedEvidence`), never a
//! fraud signal.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EvidenceId, Photo, PlanterId, PlantingEvidence, SessionId};
use crate::infra::{Result, VerificationError};

/// Upper bounds on a single submission.
#[derive(Debug, Clone)]
pub struct IntakeLimits {
    pub max_photos: usize,
    pub max_trees: u32,
    /// Tolerated clock skew between a capture and the submission.
    pub max_clock_skew: Duration,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            max_photos: 100,
            max_trees: 1000,
            max_clock_skew: Duration::minutes(5),
        }
    }
}

/// Evidence as posted by a planter's device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    #[serde(default)]
    pub evidence_id: Option<EvidenceId>,
    pub planter_id: String,
    pub session_id: String,
    pub total_trees_claimed: u32,
    #[serde(default)]
    pub species: Vec<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

fn malformed(reason: impl Into<String>) -> VerificationError {
    VerificationError::MalformedEvidence(reason.into())
}

impl EvidenceSubmission {
    /// Validate and normalize into immutable evidence. Photos come out in
    /// capture order and species lowercased.
    pub fn into_evidence(self, limits: &IntakeLimits) -> Result<PlantingEvidence> {
        let planter_id = self.planter_id.trim();
        if planter_id.is_empty() {
            return Err(malformed("planter_id is required"));
        }
        let session_id = self.session_id.trim();
        if session_id.is_empty() {
            return Err(malformed("session_id is required"));
        }
        if self.total_trees_claimed == 0 || self.total_trees_claimed > limits.max_trees {
            return Err(malformed(format!(
                "total_trees_claimed must be between 1 and {}",
                limits.max_trees
            )));
        }

        let species: BTreeSet<String> = self
            .species
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if species.is_empty() {
            return Err(malformed("at least one species is required"));
        }

        if self.photos.is_empty() {
            return Err(malformed("at least one photo is required"));
        }
        if self.photos.len() > limits.max_photos {
            return Err(malformed(format!(
                "at most {} photos per submission",
                limits.max_photos
            )));
        }

        let submitted_at = self.submitted_at.unwrap_or_else(Utc::now);
        for (index, photo) in self.photos.iter().enumerate() {
            if photo.content_hash.trim().is_empty() {
                return Err(malformed(format!("photo {index} has no content hash")));
            }
            if !photo.location.is_valid() {
                return Err(malformed(format!(
                    "photo {index} has invalid coordinates {}",
                    photo.location
                )));
            }
            if photo.captured_at > submitted_at + limits.max_clock_skew {
                return Err(malformed(format!(
                    "photo {index} was captured after submission"
                )));
            }
        }

        let mut photos = self.photos;
        photos.sort_by_key(|p| p.captured_at);

        Ok(PlantingEvidence {
            id: self.evidence_id.unwrap_or_default(),
            planter_id: PlanterId::new(planter_id),
            session_id: SessionId::new(session_id),
            total_trees_claimed: self.total_trees_claimed,
            species,
            photos,
            submitted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GeoPoint;
    use chrono::TimeZone;

    fn photo(hash: &str, minute: u32) -> Photo {
        Photo {
            content_hash: hash.to_string(),
            location: GeoPoint::new(18.4431, -72.2891),
            captured_at: Utc.with_ymd_and_hms(2024, 4, 2, 9, minute, 0).unwrap(),
            device_metadata: None,
        }
    }

    fn submission() -> EvidenceSubmission {
        EvidenceSubmission {
            evidence_id: None,
            planter_id: " planter-1 ".to_string(),
            session_id: "session-1".to_string(),
            total_trees_claimed: 10,
            species: vec!["Pine".to_string(), "pine ".to_string(), "Mahogany".to_string()],
            photos: vec![photo("b", 7), photo("a", 2)],
            submitted_at: Some(Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn normalizes_valid_submission() {
        let evidence = submission().into_evidence(&IntakeLimits::default()).unwrap();
        assert_eq!(evidence.planter_id.as_str(), "planter-1");
        assert_eq!(evidence.species.len(), 2);
        assert!(evidence.species.contains("mahogany"));
        assert_eq!(evidence.photos[0].content_hash, "a");
    }

    #[test]
    fn rejects_zero_trees() {
        let err = EvidenceSubmission {
            total_trees_claimed: 0,
            ..submission()
        }
        .into_evidence(&IntakeLimits::default())
        .unwrap_err();
        assert!(matches!(err, VerificationError::MalformedEvidence(_)));
    }

    #[test]
    fn rejects_invalid_coordinates() {
        let mut bad = submission();
        bad.photos[0].location = GeoPoint::new(123.0, -72.0);
        assert!(bad.into_evidence(&IntakeLimits::default()).is_err());
    }

    #[test]
    fn rejects_photos_from_the_future() {
        let mut bad = submission();
        bad.photos[0].captured_at = Utc.with_ymd_and_hms(2024, 4, 3, 9, 0, 0).unwrap();
        assert!(bad.into_evidence(&IntakeLimits::default()).is_err());
    }

    #[test]
    fn requires_photos_and_species() {
        let no_photos = EvidenceSubmission {
            photos: vec![],
            ..submission()
        };
        assert!(no_photos.into_evidence(&IntakeLimits::default()).is_err());

        let no_species = EvidenceSubmission {
            species: vec!["  ".to_string()],
            ..submission()
        };
        assert!(no_species.into_evidence(&IntakeLimits::default()).is_err());
    }
}
