//! Independent verification signals.
//!
//! Each checker inspects one aspect of a submission and returns a single
//! [`CheckResult`]. Checkers never mutate shared state; the only writes that
//! follow a decision go through [`DuplicateLedger`] after the aggregator has
//! decided.
//!
//! A checker returns `Err` when it cannot reach a definite answer (a
//! collaborator failed or timed out). The pipeline converts that into an
//! errored result that is excluded from scoring.

mod community;
mod duplicate;
mod geospatial;
mod photo;
mod temporal;
mod vegetation;
mod weather;
mod zone_catalog;

pub use community::CommunityAttestation;
pub use duplicate::{
    DctPerceptualHasher, DuplicateConfig, DuplicateDetector, DuplicateLedger, PerceptualHasher,
    Sha256Fingerprint,
};
pub use geospatial::{GeospatialConfig, GeospatialValidator, HAITI_BOUNDS};
pub use photo::{PhotoAnalyzer, PhotoConfig};
pub use temporal::{TemporalChecker, TemporalConfig};
pub use vegetation::{VegetationAnalyzer, VegetationConfig, INSUFFICIENT_SATELLITE_DATA};
pub use weather::{SeasonCalendar, WeatherChecker, WeatherConfig};
pub use zone_catalog::ZoneCatalog;

use async_trait::async_trait;

use crate::domain::{CheckResult, CheckerKind, PlantingEvidence};
use crate::infra::Result;

/// One verification signal.
#[async_trait]
pub trait Checker: Send + Sync {
    fn kind(&self) -> CheckerKind;

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult>;
}

/// Build a `details` object carrying a machine-readable code and a
/// human-readable reason, merged with checker-specific fields.
pub(crate) fn failure_details(
    reason_code: &str,
    reason: &str,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut details = serde_json::json!({
        "reason_code": reason_code,
        "reason": reason,
    });
    if let (Some(map), serde_json::Value::Object(extra)) = (details.as_object_mut(), extra) {
        map.extend(extra);
    }
    details
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeSet;

    use crate::domain::{
        EvidenceId, GeoPoint, Photo, PlanterId, PlantingEvidence, SessionId,
    };
    use crate::geo::METERS_PER_DEGREE;

    /// Centre of the Kenscoff default zone.
    pub const KENSCOFF: GeoPoint = GeoPoint::new(18.4431, -72.2891);

    pub fn session_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap()
    }

    pub fn offset(origin: &GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
        GeoPoint::new(
            origin.lat + north_m / METERS_PER_DEGREE,
            origin.lon + east_m / (METERS_PER_DEGREE * origin.lat.to_radians().cos()),
        )
    }

    /// Evidence with one photo per (north, east) offset, two minutes apart.
    pub fn evidence_at(origin: GeoPoint, offsets_m: &[(f64, f64)], trees: u32) -> PlantingEvidence {
        let start = session_start();
        PlantingEvidence {
            id: EvidenceId::new(),
            planter_id: PlanterId::new("planter-1"),
            session_id: SessionId::new("session-1"),
            total_trees_claimed: trees,
            species: BTreeSet::from(["pine".to_string()]),
            photos: offsets_m
                .iter()
                .enumerate()
                .map(|(i, (n, e))| Photo {
                    content_hash: format!("photo-{i}"),
                    location: offset(&origin, *n, *e),
                    captured_at: start + Duration::minutes(2 * i as i64),
                    device_metadata: None,
                })
                .collect(),
            submitted_at: start + Duration::hours(2),
        }
    }
}
