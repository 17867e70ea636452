//! Geospatial validation: region bounds, zone membership, clustering,
//! planting density and elevation.
//!
//! This checker is authoritative. An explicit failure rejects the
//! submission regardless of other signals.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{failure_details, Checker, ZoneCatalog};
use crate::domain::{CheckResult, CheckerKind, GeoPoint, PlantingEvidence, PlantingZone};
use crate::geo::{self, BoundingBox};
use crate::infra::{ElevationService, Result};

/// Operating region.
pub const HAITI_BOUNDS: BoundingBox = BoundingBox::new(18.0, 20.1, -74.5, -71.6);

#[derive(Debug, Clone)]
pub struct GeospatialConfig {
    pub region: BoundingBox,
    /// DBSCAN neighbourhood radius.
    pub cluster_radius_m: f64,
    pub cluster_min_points: usize,
    /// A cluster with more than this many points...
    pub dense_cluster_points: usize,
    /// ...packed inside this radius is bulk photography of one spot.
    pub dense_cluster_radius_m: f64,
    /// Planting rate ceiling inside a cluster.
    pub max_points_per_hour: f64,
    /// Minimum realistic spacing between saplings.
    pub min_tree_spacing_m: f64,
    /// Area credited per photo when the hull is degenerate.
    pub fallback_area_per_photo_m2: f64,
    /// Hulls smaller than this count as degenerate.
    pub min_hull_area_m2: f64,
}

impl Default for GeospatialConfig {
    fn default() -> Self {
        Self {
            region: HAITI_BOUNDS,
            cluster_radius_m: 50.0,
            cluster_min_points: 3,
            dense_cluster_points: 50,
            dense_cluster_radius_m: 10.0,
            max_points_per_hour: 100.0,
            min_tree_spacing_m: 2.0,
            fallback_area_per_photo_m2: 100.0,
            min_hull_area_m2: 1.0,
        }
    }
}

impl GeospatialConfig {
    /// Trees per square metre at minimum spacing.
    pub fn max_density(&self) -> f64 {
        1.0 / (self.min_tree_spacing_m * self.min_tree_spacing_m)
    }
}

pub struct GeospatialValidator {
    config: GeospatialConfig,
    catalog: Arc<ZoneCatalog>,
    elevation: Arc<dyn ElevationService>,
}

impl GeospatialValidator {
    pub fn new(
        config: GeospatialConfig,
        catalog: Arc<ZoneCatalog>,
        elevation: Arc<dyn ElevationService>,
    ) -> Self {
        Self {
            config,
            catalog,
            elevation,
        }
    }

    fn fail(&self, code: &str, reason: &str, extra: serde_json::Value) -> CheckResult {
        CheckResult::fail(
            CheckerKind::Geospatial,
            1.0,
            failure_details(code, reason, extra),
        )
    }

    /// Resolve every point to exactly one active zone.
    fn resolve_zone<'z>(
        &self,
        points: &[GeoPoint],
        zones: &'z [PlantingZone],
    ) -> std::result::Result<&'z PlantingZone, CheckResult> {
        let mut resolved: Option<&PlantingZone> = None;

        for (index, point) in points.iter().enumerate() {
            let matches: Vec<&PlantingZone> = zones
                .iter()
                .filter(|z| z.active && z.contains(point))
                .collect();

            match matches.as_slice() {
                [] => {
                    return Err(self.fail(
                        "not_in_zone",
                        "not in approved zone",
                        json!({ "point_index": index, "point": point }),
                    ))
                }
                [zone] => match resolved {
                    Some(prev) if prev.id != zone.id => {
                        return Err(self.fail(
                            "multiple_zones",
                            "planting spans multiple zones",
                            json!({ "zones": [prev.id, zone.id] }),
                        ))
                    }
                    _ => resolved = Some(zone),
                },
                many => {
                    let ids: Vec<&str> = many.iter().map(|z| z.id.as_str()).collect();
                    tracing::warn!(zones = ?ids, point = %point, "Overlapping planting zones");
                    return Err(self
                        .fail(
                            "zone_ambiguous",
                            "ambiguous/overlapping zone",
                            json!({ "zones": ids, "point_index": index }),
                        )
                        .with_data_quality());
                }
            }
        }

        resolved.ok_or_else(|| self.fail("not_in_zone", "not in approved zone", json!({})))
    }
}

#[async_trait]
impl Checker for GeospatialValidator {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Geospatial
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let points = evidence.points();
        let Some(centroid) = geo::centroid(&points) else {
            return Ok(self
                .fail("no_location", "submission has no photo locations", json!({}))
                .with_data_quality());
        };

        // 1. Region bounds
        let outside = points
            .iter()
            .filter(|p| !self.config.region.contains(p))
            .count();
        if outside > 0 {
            return Ok(self.fail(
                "out_of_bounds",
                "outside operating region",
                json!({ "points_outside": outside }),
            ));
        }

        // 2. Zone membership
        let zones = self.catalog.snapshot().await;
        let zone = match self.resolve_zone(&points, &zones) {
            Ok(zone) => zone,
            Err(failed) => return Ok(failed),
        };

        // 3. Clustering
        let track = evidence.track();
        let clusters = geo::cluster_points(
            &track,
            self.config.cluster_radius_m,
            self.config.cluster_min_points,
        );
        let suspicious: Vec<&geo::Cluster> = clusters
            .iter()
            .filter(|c| {
                (c.point_count > self.config.dense_cluster_points
                    && c.radius_m < self.config.dense_cluster_radius_m)
                    || c.points_per_hour()
                        .is_some_and(|rate| rate > self.config.max_points_per_hour)
            })
            .collect();
        if !suspicious.is_empty() {
            return Ok(self.fail(
                "suspicious_clustering",
                "suspicious clustering of photo locations",
                json!({ "zone_id": zone.id, "clusters": suspicious }),
            ));
        }

        // 4. Density
        let hull_area = geo::covered_area_m2(&points);
        let area_m2 = if points.len() >= 3 && hull_area >= self.config.min_hull_area_m2 {
            hull_area
        } else {
            points.len() as f64 * self.config.fallback_area_per_photo_m2
        };
        let density = f64::from(evidence.total_trees_claimed) / area_m2;
        let max_density = self.config.max_density();
        if density > max_density {
            return Ok(self.fail(
                "density_exceeded",
                "tree density exceeds realistic limits",
                json!({
                    "zone_id": zone.id,
                    "area_m2": area_m2,
                    "density": density,
                    "max_density": max_density,
                }),
            ));
        }

        // 5. Elevation; collaborator errors propagate as non-definite
        let elevation_m = self.elevation.get_elevation(centroid).await?;
        if !zone.elevation_range.contains(elevation_m) {
            return Ok(self.fail(
                "elevation_out_of_range",
                "elevation outside zone range",
                json!({
                    "zone_id": zone.id,
                    "elevation_m": elevation_m,
                    "elevation_range": zone.elevation_range,
                }),
            ));
        }

        Ok(CheckResult::pass(
            CheckerKind::Geospatial,
            1.0,
            json!({
                "zone_id": zone.id,
                "zone_name": zone.name,
                "clusters": clusters,
                "area_m2": area_m2,
                "density": density,
                "max_density": max_density,
                "elevation_m": elevation_m,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::{evidence_at, KENSCOFF};
    use crate::domain::{default_zones, ElevationRange};
    use crate::infra::{MockElevationService, VerificationError};

    fn validator(elevation: f64) -> GeospatialValidator {
        let mut mock = MockElevationService::new();
        mock.expect_get_elevation().returning(move |_| Ok(elevation));
        GeospatialValidator::new(
            GeospatialConfig::default(),
            Arc::new(ZoneCatalog::fixed(default_zones())),
            Arc::new(mock),
        )
    }

    fn square_10m() -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0), (5.0, 5.0)]
    }

    #[tokio::test]
    async fn passes_valid_planting_in_kenscoff() {
        let evidence = evidence_at(KENSCOFF, &square_10m(), 20);
        let result = validator(1800.0).check(&evidence).await.unwrap();

        assert!(result.passed, "{:?}", result.details);
        assert_eq!(result.details["zone_id"], "kenscoff");
    }

    #[tokio::test]
    async fn density_exceeded_for_500_trees_in_10m_square() {
        let evidence = evidence_at(KENSCOFF, &square_10m(), 500);
        let result = validator(1800.0).check(&evidence).await.unwrap();

        assert!(result.is_blocking_failure());
        assert_eq!(result.reason_code(), Some("density_exceeded"));
    }

    #[tokio::test]
    async fn outside_region_fails_fast() {
        let evidence = evidence_at(GeoPoint::new(40.7, -74.0), &[(0.0, 0.0)], 1);
        let result = validator(10.0).check(&evidence).await.unwrap();
        assert_eq!(result.reason_code(), Some("out_of_bounds"));
    }

    #[tokio::test]
    async fn outside_every_zone_fails() {
        // Inside Haiti, but away from the default zones
        let evidence = evidence_at(GeoPoint::new(19.5, -72.5), &[(0.0, 0.0)], 1);
        let result = validator(10.0).check(&evidence).await.unwrap();
        assert_eq!(result.details["reason"], "not in approved zone");
    }

    #[tokio::test]
    async fn overlapping_zones_flag_data_quality() {
        let mut zones = default_zones();
        let mut twin = zones[0].clone();
        twin.id = "kenscoff_twin".into();
        zones.push(twin);

        let mut mock = MockElevationService::new();
        mock.expect_get_elevation().never();
        let validator = GeospatialValidator::new(
            GeospatialConfig::default(),
            Arc::new(ZoneCatalog::fixed(zones)),
            Arc::new(mock),
        );

        let result = validator
            .check(&evidence_at(KENSCOFF, &square_10m(), 10))
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.data_quality);
        assert_eq!(result.reason_code(), Some("zone_ambiguous"));
    }

    #[tokio::test]
    async fn elevation_outside_zone_range_fails() {
        let result = validator(300.0)
            .check(&evidence_at(KENSCOFF, &square_10m(), 10))
            .await
            .unwrap();
        assert_eq!(result.reason_code(), Some("elevation_out_of_range"));
    }

    #[tokio::test]
    async fn elevation_outage_is_not_a_verdict() {
        let mut mock = MockElevationService::new();
        mock.expect_get_elevation()
            .returning(|_| Err(VerificationError::collaborator("elevation", "503")));
        let validator = GeospatialValidator::new(
            GeospatialConfig::default(),
            Arc::new(ZoneCatalog::fixed(default_zones())),
            Arc::new(mock),
        );

        let outcome = validator
            .check(&evidence_at(KENSCOFF, &square_10m(), 10))
            .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn inactive_zone_does_not_match() {
        let mut zones = default_zones();
        zones[0].active = false;
        let mut mock = MockElevationService::new();
        mock.expect_get_elevation().returning(|_| Ok(1800.0));
        let validator = GeospatialValidator::new(
            GeospatialConfig::default(),
            Arc::new(ZoneCatalog::fixed(zones)),
            Arc::new(mock),
        );

        let result = validator
            .check(&evidence_at(KENSCOFF, &square_10m(), 10))
            .await
            .unwrap();
        assert_eq!(result.reason_code(), Some("not_in_zone"));
    }

    #[tokio::test]
    async fn zone_elevation_bounds_are_inclusive() {
        let zones = vec![PlantingZone::rectangle(
            "ridge",
            "Ridge",
            18.43,
            -72.30,
            18.46,
            -72.28,
            ElevationRange {
                min: 1500.0,
                max: 1500.0,
            },
        )];
        let mut mock = MockElevationService::new();
        mock.expect_get_elevation().returning(|_| Ok(1500.0));
        let validator = GeospatialValidator::new(
            GeospatialConfig::default(),
            Arc::new(ZoneCatalog::fixed(zones)),
            Arc::new(mock),
        );

        let result = validator
            .check(&evidence_at(KENSCOFF, &square_10m(), 10))
            .await
            .unwrap();
        assert!(result.passed, "{:?}", result.details);
    }
}
