//! Before/after satellite vegetation comparison.
//!
//! Soft checker. Missing or poor imagery is not evidence of fraud, so a
//! low-confidence comparison passes with a flag instead of failing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::{failure_details, Checker};
use crate::domain::{CheckResult, CheckerKind, DateRange, Imagery, PlantingEvidence};
use crate::infra::{ImageryService, Result};

/// `details.reason` for a skipped comparison.
pub const INSUFFICIENT_SATELLITE_DATA: &str = "insufficient satellite data";

#[derive(Debug, Clone)]
pub struct VegetationConfig {
    /// Window edges, in days from the claim date.
    pub window_near_days: i64,
    pub window_far_days: i64,
    pub max_cloud_cover: f64,
    /// Below this, the comparison is skipped.
    pub confidence_floor: f64,
    /// Canopy area credited per claimed tree.
    pub tree_footprint_m2: f64,
    pub min_match_ratio: f64,
    pub max_match_ratio: f64,
    /// Scenes at or below this resolution score 1.0.
    pub fine_resolution_m: f64,
    pub coarse_resolution_score: f64,
}

impl Default for VegetationConfig {
    fn default() -> Self {
        Self {
            window_near_days: 30,
            window_far_days: 60,
            max_cloud_cover: 30.0,
            confidence_floor: 0.5,
            tree_footprint_m2: 4.0,
            min_match_ratio: 0.5,
            max_match_ratio: 1.5,
            fine_resolution_m: 10.0,
            coarse_resolution_score: 0.7,
        }
    }
}

impl VegetationConfig {
    fn before_window(&self, claimed: DateTime<Utc>) -> DateRange {
        DateRange::new(
            claimed - Duration::days(self.window_far_days),
            claimed - Duration::days(self.window_near_days),
        )
    }

    fn after_window(&self, claimed: DateTime<Utc>) -> DateRange {
        DateRange::new(
            claimed + Duration::days(self.window_near_days),
            claimed + Duration::days(self.window_far_days),
        )
    }

    /// Confidence from cloud cover, temporal separation and resolution.
    pub fn scene_confidence(&self, before: &Imagery, after: &Imagery) -> f64 {
        let cloud = 1.0 - (before.cloud_cover + after.cloud_cover) / 200.0;
        let days = (after.date - before.date).num_days().abs() as f64;
        let time = (1.0 - days / 365.0).max(0.0);
        let resolution = if before.resolution_m.max(after.resolution_m) <= self.fine_resolution_m {
            1.0
        } else {
            self.coarse_resolution_score
        };
        ((cloud + time + resolution) / 3.0).clamp(0.0, 1.0)
    }
}

/// Least cloudy scene, ties broken by closeness to `target`.
fn best_scene(scenes: Vec<Imagery>, target: DateTime<Utc>) -> Option<Imagery> {
    scenes.into_iter().min_by(|a, b| {
        a.cloud_cover
            .total_cmp(&b.cloud_cover)
            .then_with(|| {
                let da = (a.date - target).num_seconds().abs();
                let db = (b.date - target).num_seconds().abs();
                da.cmp(&db)
            })
    })
}

pub struct VegetationAnalyzer {
    config: VegetationConfig,
    imagery: Arc<dyn ImageryService>,
}

impl VegetationAnalyzer {
    pub fn new(config: VegetationConfig, imagery: Arc<dyn ImageryService>) -> Self {
        Self { config, imagery }
    }

    fn insufficient(&self, confidence: f64, extra: serde_json::Value) -> CheckResult {
        let mut details = failure_details("insufficient_data", INSUFFICIENT_SATELLITE_DATA, extra);
        details["low_confidence"] = json!(true);
        CheckResult::pass(CheckerKind::Satellite, confidence, details)
    }
}

#[async_trait]
impl Checker for VegetationAnalyzer {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Satellite
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let Some(location) = evidence.centroid() else {
            return Ok(self.insufficient(0.0, json!({})));
        };
        let claimed = evidence.claimed_at();
        let before_window = self.config.before_window(claimed);
        let after_window = self.config.after_window(claimed);

        let (before, after) = tokio::try_join!(
            self.imagery
                .search_imagery(location, before_window, self.config.max_cloud_cover),
            self.imagery
                .search_imagery(location, after_window, self.config.max_cloud_cover),
        )?;

        let scene_counts = json!({ "before_scenes": before.len(), "after_scenes": after.len() });
        let (Some(before), Some(after)) = (
            best_scene(before, before_window.midpoint()),
            best_scene(after, after_window.midpoint()),
        ) else {
            tracing::debug!(evidence_id = %evidence.id, "No usable imagery");
            return Ok(self.insufficient(0.0, scene_counts));
        };

        let change = self
            .imagery
            .analyze_vegetation_change(location, &before, &after)
            .await?;
        let confidence = self
            .config
            .scene_confidence(&before, &after)
            .min(change.confidence.clamp(0.0, 1.0));

        let expected_area_m2 =
            f64::from(evidence.total_trees_claimed) * self.config.tree_footprint_m2;
        let match_ratio = if expected_area_m2 > 0.0 {
            change.increased_area_m2 / expected_area_m2
        } else {
            0.0
        };
        let details = json!({
            "before_image": before.id,
            "after_image": after.id,
            "index_delta": change.index_delta,
            "increased_area_m2": change.increased_area_m2,
            "expected_area_m2": expected_area_m2,
            "match_ratio": match_ratio,
            "confidence": confidence,
        });

        if confidence < self.config.confidence_floor {
            return Ok(self.insufficient(confidence, details));
        }

        let passed = (self.config.min_match_ratio..=self.config.max_match_ratio)
            .contains(&match_ratio);
        Ok(if passed {
            CheckResult::pass(CheckerKind::Satellite, confidence, details)
        } else {
            CheckResult::fail(
                CheckerKind::Satellite,
                confidence,
                failure_details(
                    "vegetation_mismatch",
                    "vegetation change does not match claimed trees",
                    details,
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::{evidence_at, session_start, KENSCOFF};
    use crate::domain::VegetationChange;
    use crate::infra::{MockImageryService, VerificationError};

    fn scene(id: &str, days_from_claim: i64, cloud: f64) -> Imagery {
        Imagery {
            id: id.into(),
            date: session_start() + Duration::days(days_from_claim),
            cloud_cover: cloud,
            resolution_m: 10.0,
            url: format!("https://imagery.test/{id}"),
        }
    }

    fn mock_with(area: f64, provider_confidence: f64) -> MockImageryService {
        let mut mock = MockImageryService::new();
        mock.expect_search_imagery().returning(|_, window, _| {
            let before = window.end <= session_start();
            Ok(if before {
                vec![scene("b-cloudy", -40, 25.0), scene("b-clear", -45, 5.0)]
            } else {
                vec![scene("a-clear", 45, 5.0)]
            })
        });
        mock.expect_analyze_vegetation_change()
            .returning(move |_, _, _| {
                Ok(VegetationChange {
                    index_delta: 0.12,
                    increased_area_m2: area,
                    confidence: provider_confidence,
                })
            });
        mock
    }

    #[test]
    fn confidence_blends_cloud_time_and_resolution() {
        let config = VegetationConfig::default();
        let c = config.scene_confidence(&scene("b", -45, 0.0), &scene("a", 45, 0.0));
        // cloud 1.0, time 1 - 90/365, resolution 1.0
        let expected = (1.0 + (1.0 - 90.0 / 365.0) + 1.0) / 3.0;
        assert!((c - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn passes_when_area_matches_claim() {
        let analyzer = VegetationAnalyzer::new(VegetationConfig::default(), Arc::new(mock_with(40.0, 0.9)));
        let evidence = evidence_at(KENSCOFF, &[(0.0, 0.0)], 10);

        let result = analyzer.check(&evidence).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.details["before_image"], "b-clear");
        assert!((result.details["match_ratio"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fails_when_area_far_below_claim() {
        let analyzer = VegetationAnalyzer::new(VegetationConfig::default(), Arc::new(mock_with(4.0, 0.9)));
        let result = analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0)], 10))
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.reason_code(), Some("vegetation_mismatch"));
        assert!(!result.is_blocking_failure());
    }

    #[tokio::test]
    async fn low_confidence_soft_skips() {
        let analyzer = VegetationAnalyzer::new(VegetationConfig::default(), Arc::new(mock_with(4.0, 0.3)));
        let result = analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0)], 10))
            .await
            .unwrap();

        assert!(result.passed);
        assert_eq!(result.details["reason"], INSUFFICIENT_SATELLITE_DATA);
        assert_eq!(result.details["low_confidence"], true);
        assert!((result.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_scenes_soft_skips_without_comparison() {
        let mut mock = MockImageryService::new();
        mock.expect_search_imagery().returning(|_, _, _| Ok(vec![]));
        mock.expect_analyze_vegetation_change().never();
        let analyzer = VegetationAnalyzer::new(VegetationConfig::default(), Arc::new(mock));

        let result = analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0)], 10))
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.details["reason"], INSUFFICIENT_SATELLITE_DATA);
    }

    #[tokio::test]
    async fn search_failure_is_not_a_verdict() {
        let mut mock = MockImageryService::new();
        mock.expect_search_imagery()
            .returning(|_, _, _| Err(VerificationError::collaborator("imagery", "502")));
        let analyzer = VegetationAnalyzer::new(VegetationConfig::default(), Arc::new(mock));

        assert!(analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0)], 10))
            .await
            .is_err());
    }
}
