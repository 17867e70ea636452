//! Weighted score aggregation and the decision rules.
//!
//! Errored results are excluded from both numerator and denominator, so an
//! absent signal renormalizes the score instead of lowering it. Blocking
//! failures win over any score; a hard blocker that did not finish holds the
//! submission pending.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    CheckResult, CheckerKind, DecisionStatus, EvidenceId, Rejection, RejectionCode,
    VerificationLog,
};
use crate::infra::{Result, VerificationError};

/// Scores this close below the threshold still count as reaching it.
const SCORE_EPSILON: f64 = 1e-9;

/// Per-checker weights. Renormalized over the participating checkers, so
/// they need not sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckWeights {
    pub geospatial: f64,
    pub satellite: f64,
    pub photo: f64,
    pub duplicate: f64,
    pub weather: f64,
    pub temporal: f64,
    pub community: f64,
}

impl Default for CheckWeights {
    fn default() -> Self {
        Self {
            geospatial: 0.20,
            satellite: 0.25,
            photo: 0.25,
            duplicate: 0.15,
            weather: 0.05,
            temporal: 0.05,
            community: 0.05,
        }
    }
}

impl CheckWeights {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let weight = |key: &str, default: f64| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Self {
            geospatial: weight("WEIGHT_GEOSPATIAL", defaults.geospatial),
            satellite: weight("WEIGHT_SATELLITE", defaults.satellite),
            photo: weight("WEIGHT_PHOTO", defaults.photo),
            duplicate: weight("WEIGHT_DUPLICATE", defaults.duplicate),
            weather: weight("WEIGHT_WEATHER", defaults.weather),
            temporal: weight("WEIGHT_TEMPORAL", defaults.temporal),
            community: weight("WEIGHT_COMMUNITY", defaults.community),
        }
    }

    pub fn weight(&self, kind: CheckerKind) -> f64 {
        match kind {
            CheckerKind::Geospatial => self.geospatial,
            CheckerKind::Satellite => self.satellite,
            CheckerKind::Photo => self.photo,
            CheckerKind::Duplicate => self.duplicate,
            CheckerKind::Weather => self.weather,
            CheckerKind::Temporal => self.temporal,
            CheckerKind::Community => self.community,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = CheckerKind::CORE
            .iter()
            .chain(std::iter::once(&CheckerKind::Community));
        for kind in all {
            let w = self.weight(*kind);
            if !w.is_finite() || w < 0.0 {
                return Err(VerificationError::Configuration(format!(
                    "weight for {kind} must be a non-negative number, got {w}"
                )));
            }
        }
        if CheckerKind::CORE.iter().map(|k| self.weight(*k)).sum::<f64>() <= 0.0 {
            return Err(VerificationError::Configuration(
                "checker weights sum to zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of aggregation, before it is written as a log row.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: DecisionStatus,
    pub weighted_score: f64,
    pub participating_weight: f64,
    pub rejection: Option<Rejection>,
    pub recommendations: Vec<String>,
}

impl Decision {
    pub fn verified(&self) -> bool {
        self.status == DecisionStatus::Verified
    }

    /// Replace the outcome with a rejection, keeping the score.
    pub fn reject(mut self, code: RejectionCode, reason: impl Into<String>) -> Self {
        self.status = DecisionStatus::Rejected;
        self.rejection = Some(Rejection {
            code,
            reason: reason.into(),
        });
        self
    }

    /// Replace the outcome with a pending hold, keeping the score.
    pub fn hold(mut self, note: impl Into<String>) -> Self {
        self.status = DecisionStatus::Pending;
        self.rejection = None;
        push_unique(&mut self.recommendations, note.into());
        self
    }

    pub fn into_log(
        self,
        evidence_id: EvidenceId,
        results: Vec<CheckResult>,
        supersedes: Option<Uuid>,
    ) -> VerificationLog {
        VerificationLog {
            id: Uuid::new_v4(),
            evidence_id,
            results,
            weighted_score: self.weighted_score,
            participating_weight: self.participating_weight,
            verified: self.status == DecisionStatus::Verified,
            status: self.status,
            rejection: self.rejection,
            recommendations: self.recommendations,
            manual_override: None,
            supersedes,
            created_at: Utc::now(),
        }
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// The reason a checker gave for failing, or a generic one.
fn failure_reason(result: &CheckResult) -> String {
    result
        .details
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|r| format!("{}: {r}", result.checker))
        .unwrap_or_else(|| format!("{} check failed", result.checker))
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    weights: CheckWeights,
    threshold: f64,
    min_participating_weight: f64,
}

impl Aggregator {
    pub fn new(weights: CheckWeights, threshold: f64) -> Self {
        Self {
            weights,
            threshold,
            min_participating_weight: 0.0,
        }
    }

    pub fn with_min_participating_weight(mut self, floor: f64) -> Self {
        self.min_participating_weight = floor;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// (renormalized score, participating weight). The score is 0 when
    /// nothing participated.
    pub fn score(&self, results: &[CheckResult]) -> (f64, f64) {
        let mut earned = 0.0;
        let mut participating = 0.0;
        for result in results.iter().filter(|r| r.participates()) {
            let weight = self.weights.weight(result.checker);
            participating += weight;
            if result.passed {
                earned += weight;
            }
        }
        if participating <= 0.0 {
            (0.0, 0.0)
        } else {
            (earned / participating, participating)
        }
    }

    pub fn decide(&self, results: &[CheckResult]) -> Decision {
        let (weighted_score, participating_weight) = self.score(results);
        let base = Decision {
            status: DecisionStatus::Pending,
            weighted_score,
            participating_weight,
            rejection: None,
            recommendations: recommendations(results),
        };

        let blocking: Vec<&CheckResult> =
            results.iter().filter(|r| r.is_blocking_failure()).collect();
        if let Some(fraud) = blocking.iter().find(|r| !r.data_quality) {
            return base.reject(RejectionCode::HardReject, failure_reason(fraud));
        }
        if let Some(bad_data) = blocking.first() {
            return base.reject(RejectionCode::ConfigError, failure_reason(bad_data));
        }

        if let Some(stalled) = results.iter().find(|r| {
            (r.checker.is_hard_blocker() && r.timed_out())
                || (r.checker == CheckerKind::Geospatial && !r.participates())
        }) {
            return base.hold(format!(
                "Verification pending: {} check did not complete",
                stalled.checker
            ));
        }

        if participating_weight <= 0.0 || participating_weight < self.min_participating_weight {
            return base.hold("Verification pending: not enough checks completed");
        }

        if weighted_score + SCORE_EPSILON >= self.threshold {
            Decision {
                status: DecisionStatus::Verified,
                ..base
            }
        } else {
            let reason = format!(
                "score {:.2} below threshold {:.2}",
                weighted_score, self.threshold
            );
            base.reject(RejectionCode::LowScore, reason)
        }
    }
}

/// Planter-facing advice drawn from the failed or degraded checks.
pub fn recommendations(results: &[CheckResult]) -> Vec<String> {
    let mut out = Vec::new();
    let mut add = |s: String| push_unique(&mut out, s);

    for result in results {
        if result.is_definite_failure() {
            match result.checker {
                CheckerKind::Geospatial => {
                    add("Ensure GPS is enabled and has clear sky view".into());
                    add("Plant only in approved zones".into());
                }
                CheckerKind::Photo | CheckerKind::Duplicate => {
                    add("Take clear photos showing individual trees".into());
                    add("Avoid duplicate or edited images".into());
                }
                CheckerKind::Weather => {
                    add("Plant during optimal season (March-May or October-November)".into());
                    add("Avoid planting in extreme weather".into());
                }
                CheckerKind::Temporal => {
                    add("Photograph trees as you plant them in a single session".into());
                }
                CheckerKind::Satellite | CheckerKind::Community => {}
            }
        }

        if result.checker == CheckerKind::Satellite
            && result.participates()
            && result.confidence < 0.7
        {
            add("Allow 30+ days for satellite verification".into());
        }

        if !result.participates()
            && !result.checker.is_hard_blocker()
            && result.checker != CheckerKind::Community
        {
            add(format!(
                "{} check unavailable; decision made without it",
                result.checker
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CheckErrorKind;
    use serde_json::json;

    fn pass(kind: CheckerKind) -> CheckResult {
        CheckResult::pass(kind, 0.9, json!({}))
    }

    fn fail(kind: CheckerKind, reason: &str) -> CheckResult {
        CheckResult::fail(kind, 0.9, json!({ "reason": reason }))
    }

    fn all_passing() -> Vec<CheckResult> {
        CheckerKind::CORE.iter().map(|k| pass(*k)).collect()
    }

    fn replace(results: &mut [CheckResult], replacement: CheckResult) {
        if let Some(slot) = results.iter_mut().find(|r| r.checker == replacement.checker) {
            *slot = replacement;
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(CheckWeights::default(), 0.75)
    }

    #[test]
    fn all_passing_verifies() {
        let decision = aggregator().decide(&all_passing());
        assert!(decision.verified());
        assert!((decision.weighted_score - 1.0).abs() < 1e-9);
        assert!((decision.participating_weight - 0.95).abs() < 1e-9);
        assert!(decision.recommendations.is_empty());
    }

    #[test]
    fn geospatial_failure_rejects_regardless_of_score() {
        let mut results = all_passing();
        replace(&mut results, fail(CheckerKind::Geospatial, "not in approved zone"));

        let decision = aggregator().decide(&results);
        assert_eq!(decision.status, DecisionStatus::Rejected);
        let rejection = decision.rejection.unwrap();
        assert_eq!(rejection.code, RejectionCode::HardReject);
        assert_eq!(rejection.reason, "geospatial: not in approved zone");
        assert!(decision
            .recommendations
            .contains(&"Plant only in approved zones".to_string()));
    }

    #[test]
    fn zone_ambiguity_is_a_config_error() {
        let mut results = all_passing();
        replace(
            &mut results,
            fail(CheckerKind::Geospatial, "ambiguous/overlapping zone").with_data_quality(),
        );

        let decision = aggregator().decide(&results);
        assert_eq!(
            decision.rejection.map(|r| r.code),
            Some(RejectionCode::ConfigError)
        );
    }

    #[test]
    fn photo_tamper_tag_blocks() {
        let mut results = all_passing();
        replace(
            &mut results,
            fail(CheckerKind::Photo, "digital_manipulation").with_hard_block(),
        );
        let decision = aggregator().decide(&results);
        assert_eq!(
            decision.rejection.map(|r| r.code),
            Some(RejectionCode::HardReject)
        );
    }

    #[test]
    fn errored_soft_checker_is_renormalized_out() {
        let mut results = all_passing();
        replace(
            &mut results,
            CheckResult::errored(CheckerKind::Satellite, CheckErrorKind::Timeout, "deadline"),
        );
        replace(&mut results, fail(CheckerKind::Temporal, "implied speed too high"));

        let decision = aggregator().decide(&results);
        // (0.95 - 0.25 - 0.05) / (0.95 - 0.25)
        assert!((decision.weighted_score - 0.65 / 0.70).abs() < 1e-9);
        assert!(decision.verified());
        assert!(decision
            .recommendations
            .contains(&"satellite check unavailable; decision made without it".to_string()));
    }

    #[test]
    fn hard_blocker_timeout_holds_pending() {
        let mut results = all_passing();
        replace(
            &mut results,
            CheckResult::errored(CheckerKind::Duplicate, CheckErrorKind::Cancelled, "deadline"),
        );
        let decision = aggregator().decide(&results);
        assert_eq!(decision.status, DecisionStatus::Pending);
        assert!(decision.rejection.is_none());
    }

    #[test]
    fn duplicate_lookup_error_stays_non_blocking() {
        let mut results = all_passing();
        replace(
            &mut results,
            CheckResult::errored(CheckerKind::Duplicate, CheckErrorKind::Unavailable, "index down"),
        );
        assert!(aggregator().decide(&results).verified());
    }

    #[test]
    fn geospatial_error_holds_pending() {
        let mut results = all_passing();
        replace(
            &mut results,
            CheckResult::errored(CheckerKind::Geospatial, CheckErrorKind::Unavailable, "elevation"),
        );
        assert_eq!(aggregator().decide(&results).status, DecisionStatus::Pending);
    }

    #[test]
    fn low_score_rejects() {
        let mut results = all_passing();
        replace(&mut results, fail(CheckerKind::Satellite, "no vegetation change"));
        replace(&mut results, fail(CheckerKind::Weather, "restricted season"));

        let decision = aggregator().decide(&results);
        assert_eq!(
            decision.rejection.as_ref().map(|r| r.code),
            Some(RejectionCode::LowScore)
        );
        assert!(decision.weighted_score < 0.75);
    }

    #[test]
    fn participation_floor_holds_pending() {
        let results = vec![
            pass(CheckerKind::Geospatial),
            pass(CheckerKind::Duplicate),
            CheckResult::errored(CheckerKind::Satellite, CheckErrorKind::Unavailable, "x"),
            CheckResult::errored(CheckerKind::Photo, CheckErrorKind::Unavailable, "x"),
            CheckResult::errored(CheckerKind::Weather, CheckErrorKind::Unavailable, "x"),
            CheckResult::errored(CheckerKind::Temporal, CheckErrorKind::Unavailable, "x"),
        ];

        assert!(aggregator().decide(&results).verified());
        let strict = aggregator().with_min_participating_weight(0.5);
        assert_eq!(strict.decide(&results).status, DecisionStatus::Pending);
    }

    #[test]
    fn low_satellite_confidence_recommends_waiting() {
        let mut results = all_passing();
        replace(
            &mut results,
            CheckResult::pass(CheckerKind::Satellite, 0.3, json!({})),
        );
        let decision = aggregator().decide(&results);
        assert_eq!(
            decision.recommendations,
            vec!["Allow 30+ days for satellite verification".to_string()]
        );
    }

    #[test]
    fn rejects_negative_weights() {
        let weights = CheckWeights {
            photo: -0.1,
            ..CheckWeights::default()
        };
        assert!(weights.validate().is_err());
    }
}
