//! Planting evidence as submitted by a planter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{EvidenceId, GeoPoint, PlanterId, SessionId};

/// Optional capture metadata reported by the planter's device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Whether the original file carried an EXIF block.
    #[serde(default)]
    pub has_exif: bool,
}

/// A single geotagged photo. The bytes live in the storage collaborator and
/// are addressed by `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub content_hash: String,
    pub location: GeoPoint,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metadata: Option<DeviceMetadata>,
}

/// One (location, timestamp) sample of a planter's track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub location: GeoPoint,
    pub at: DateTime<Utc>,
}

/// Immutable submission bundle.
///
/// Photos are kept in capture order; intake sorts them before the evidence is
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantingEvidence {
    pub id: EvidenceId,
    pub planter_id: PlanterId,
    pub session_id: SessionId,
    pub total_trees_claimed: u32,
    pub species: BTreeSet<String>,
    pub photos: Vec<Photo>,
    pub submitted_at: DateTime<Utc>,
}

impl PlantingEvidence {
    /// Photo locations in capture order.
    pub fn points(&self) -> Vec<GeoPoint> {
        self.photos.iter().map(|p| p.location).collect()
    }

    /// Ordered (location, timestamp) track.
    pub fn track(&self) -> Vec<TrackPoint> {
        self.photos
            .iter()
            .map(|p| TrackPoint {
                location: p.location,
                at: p.captured_at,
            })
            .collect()
    }

    /// Arithmetic centroid of the photo locations.
    pub fn centroid(&self) -> Option<GeoPoint> {
        crate::geo::centroid(&self.points())
    }

    /// The claimed planting moment: the first capture of the session, or
    /// the submission time when there are no photos.
    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.photos
            .iter()
            .map(|p| p.captured_at)
            .min()
            .unwrap_or(self.submitted_at)
    }

    pub fn photo_count(&self) -> usize {
        self.photos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn photo(lat: f64, lon: f64, minute: u32) -> Photo {
        Photo {
            content_hash: format!("hash-{minute}"),
            location: GeoPoint::new(lat, lon),
            captured_at: Utc.with_ymd_and_hms(2024, 4, 2, 9, minute, 0).unwrap(),
            device_metadata: None,
        }
    }

    #[test]
    fn claimed_at_is_earliest_capture() {
        let evidence = PlantingEvidence {
            id: EvidenceId::new(),
            planter_id: PlanterId::new("p"),
            session_id: SessionId::new("s"),
            total_trees_claimed: 2,
            species: BTreeSet::new(),
            photos: vec![photo(18.44, -72.29, 5), photo(18.44, -72.29, 1)],
            submitted_at: Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap(),
        };

        assert_eq!(
            evidence.claimed_at(),
            Utc.with_ymd_and_hms(2024, 4, 2, 9, 1, 0).unwrap()
        );
        assert_eq!(evidence.track().len(), 2);
    }
}
