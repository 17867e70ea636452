//! Cross-photo timing plausibility: travel speed, lighting window and pace.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use super::{failure_details, Checker};
use crate::domain::{CheckResult, CheckerKind, PlantingEvidence};
use crate::geo::haversine_m;
use crate::infra::Result;

#[derive(Debug, Clone)]
pub struct TemporalConfig {
    /// Fastest plausible movement between consecutive photos.
    pub max_speed_mps: f64,
    /// Captures further than this from the first photo see different light.
    pub lighting_window: Duration,
    /// Planting one tree takes at least this long on average.
    pub min_seconds_per_photo: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            max_speed_mps: 10.0,
            lighting_window: Duration::hours(3),
            min_seconds_per_photo: 30.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct TemporalChecker {
    config: TemporalConfig,
}

impl TemporalChecker {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Checker for TemporalChecker {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Temporal
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let mut track = evidence.track();
        if track.len() < 2 {
            return Ok(CheckResult::pass(
                CheckerKind::Temporal,
                0.3,
                json!({ "reason": "insufficient data", "photos": track.len() }),
            ));
        }
        track.sort_by_key(|p| p.at);

        let mut violations = Vec::new();
        let mut max_speed: f64 = 0.0;
        for (i, pair) in track.windows(2).enumerate() {
            let distance = haversine_m(&pair[0].location, &pair[1].location);
            let seconds = (pair[1].at - pair[0].at).num_milliseconds() as f64 / 1000.0;
            let speed = if seconds > 0.0 {
                distance / seconds
            } else if distance > 0.0 {
                f64::INFINITY
            } else {
                0.0
            };
            if speed > self.config.max_speed_mps {
                violations.push(json!({
                    "from": i,
                    "to": i + 1,
                    "distance_m": distance,
                    "seconds": seconds,
                    "speed_mps": if speed.is_finite() { json!(speed) } else { json!("infinite") },
                }));
            }
            if speed.is_finite() {
                max_speed = max_speed.max(speed);
            }
        }

        let first = track[0].at;
        let last = track[track.len() - 1].at;
        let lighting_consistent = track
            .iter()
            .all(|p| (p.at - first).abs() <= self.config.lighting_window);

        let span_seconds = (last - first).num_milliseconds() as f64 / 1000.0;
        let avg_seconds_per_photo = span_seconds / (track.len() - 1) as f64;
        let rushed = avg_seconds_per_photo < self.config.min_seconds_per_photo;

        let confidence = if lighting_consistent { 0.9 } else { 0.5 };
        let mut details = json!({
            "speed_violations": violations,
            "max_speed_mps": max_speed,
            "lighting_consistent": lighting_consistent,
            "session_minutes": span_seconds / 60.0,
            "avg_seconds_per_photo": avg_seconds_per_photo,
        });

        if !violations.is_empty() {
            details = failure_details(
                "impossible_travel",
                "implied travel speed exceeds plausible ceiling",
                details,
            );
            return Ok(CheckResult::fail(CheckerKind::Temporal, confidence, details));
        }
        if rushed {
            details = failure_details("rushed_session", "photos taken too quickly", details);
            return Ok(CheckResult::fail(CheckerKind::Temporal, confidence, details));
        }
        Ok(CheckResult::pass(CheckerKind::Temporal, confidence, details))
    }
}
