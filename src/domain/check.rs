//! Per-checker results.
//!
//! Every checker produces exactly one [`CheckResult`] tagged by its
//! [`CheckerKind`]. Results are immutable once produced and are folded into a
//! [`VerificationLog`](super::VerificationLog) by the aggregator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The independent verification signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    Geospatial,
    Satellite,
    Photo,
    Duplicate,
    Weather,
    Temporal,
    Community,
}

impl CheckerKind {
    /// Checkers that always run, in reporting order.
    pub const CORE: [CheckerKind; 6] = [
        CheckerKind::Geospatial,
        CheckerKind::Satellite,
        CheckerKind::Photo,
        CheckerKind::Duplicate,
        CheckerKind::Weather,
        CheckerKind::Temporal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckerKind::Geospatial => "geospatial",
            CheckerKind::Satellite => "satellite",
            CheckerKind::Photo => "photo",
            CheckerKind::Duplicate => "duplicate",
            CheckerKind::Weather => "weather",
            CheckerKind::Temporal => "temporal",
            CheckerKind::Community => "community",
        }
    }

    /// Authoritative checkers: an explicit failure rejects the submission and
    /// a timeout holds it pending.
    pub fn is_hard_blocker(&self) -> bool {
        matches!(self, CheckerKind::Geospatial | CheckerKind::Duplicate)
    }
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geospatial" => Ok(CheckerKind::Geospatial),
            "satellite" => Ok(CheckerKind::Satellite),
            "photo" => Ok(CheckerKind::Photo),
            "duplicate" => Ok(CheckerKind::Duplicate),
            "weather" => Ok(CheckerKind::Weather),
            "temporal" => Ok(CheckerKind::Temporal),
            "community" => Ok(CheckerKind::Community),
            other => Err(format!("unknown checker: {other}")),
        }
    }
}

/// Why a checker could not produce a definite answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckErrorKind {
    /// A collaborator failed or the circuit is open.
    Unavailable,
    /// The per-checker deadline elapsed.
    Timeout,
    /// The submission-level deadline cancelled the call.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckError {
    pub kind: CheckErrorKind,
    pub message: String,
}

/// One checker's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub checker: CheckerKind,
    pub passed: bool,
    pub confidence: f64,
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckError>,
    /// Failure is authoritative even for a checker that is normally soft
    /// (e.g. a tamper tag from the photo analyzer).
    #[serde(default)]
    pub hard_block: bool,
    /// Failure stems from bad reference data or malformed input rather than
    /// a fraud signal.
    #[serde(default)]
    pub data_quality: bool,
}

impl CheckResult {
    pub fn pass(checker: CheckerKind, confidence: f64, details: serde_json::Value) -> Self {
        Self {
            checker,
            passed: true,
            confidence: confidence.clamp(0.0, 1.0),
            details,
            error: None,
            hard_block: false,
            data_quality: false,
        }
    }

    pub fn fail(checker: CheckerKind, confidence: f64, details: serde_json::Value) -> Self {
        Self {
            passed: false,
            ..Self::pass(checker, confidence, details)
        }
    }

    /// A non-definite result. It is excluded from scoring.
    pub fn errored(checker: CheckerKind, kind: CheckErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            checker,
            passed: true,
            confidence: 0.0,
            details: serde_json::json!({ "error": message }),
            error: Some(CheckError { kind, message }),
            hard_block: false,
            data_quality: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_hard_block(mut self) -> Self {
        self.hard_block = true;
        self
    }

    pub fn with_data_quality(mut self) -> Self {
        self.data_quality = true;
        self
    }

    /// Whether the result counts toward the weighted score.
    pub fn participates(&self) -> bool {
        self.error.is_none()
    }

    /// An explicit `passed=false` (as opposed to an error).
    pub fn is_definite_failure(&self) -> bool {
        self.error.is_none() && !self.passed
    }

    /// Definite failure that no score can outweigh.
    pub fn is_blocking_failure(&self) -> bool {
        self.is_definite_failure() && (self.checker.is_hard_blocker() || self.hard_block)
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self.error,
            Some(CheckError {
                kind: CheckErrorKind::Timeout | CheckErrorKind::Cancelled,
                ..
            })
        )
    }

    /// Machine-readable reason code, when the checker set one.
    pub fn reason_code(&self) -> Option<&str> {
        self.details.get("reason_code").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn errored_results_do_not_participate() {
        let r = CheckResult::errored(CheckerKind::Weather, CheckErrorKind::Timeout, "deadline");
        assert!(!r.participates());
        assert!(!r.is_definite_failure());
        assert!(r.timed_out());
    }

    #[test]
    fn only_authoritative_failures_block() {
        let geo = CheckResult::fail(CheckerKind::Geospatial, 1.0, json!({}));
        let temporal = CheckResult::fail(CheckerKind::Temporal, 0.8, json!({}));
        let photo = CheckResult::fail(CheckerKind::Photo, 0.9, json!({})).with_hard_block();

        assert!(geo.is_blocking_failure());
        assert!(!temporal.is_blocking_failure());
        assert!(photo.is_blocking_failure());
    }

    #[test]
    fn checker_kind_round_trips_through_str() {
        for kind in CheckerKind::CORE {
            assert_eq!(kind.as_str().parse::<CheckerKind>().unwrap(), kind);
        }
    }
}
