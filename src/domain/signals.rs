//! Payloads exchanged with external signal providers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed date interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn midpoint(&self) -> DateTime<Utc> {
        self.start + (self.end - self.start) / 2
    }
}

/// A satellite scene covering a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imagery {
    pub id: String,
    pub date: DateTime<Utc>,
    /// Percent, 0..=100.
    pub cloud_cover: f64,
    /// Ground sample distance in metres.
    pub resolution_m: f64,
    pub url: String,
}

/// Result of comparing two scenes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VegetationChange {
    pub index_delta: f64,
    pub increased_area_m2: f64,
    pub confidence: f64,
}

/// Conditions at a place and moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    /// Millimetres per hour.
    pub rainfall_mm: f64,
}

/// Quality assessment and anomaly tags produced by the inference provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoAssessment {
    pub health: f64,
    pub quality: f64,
    #[serde(default)]
    pub anomalies: Vec<String>,
}

/// Field coordinator's sign-off on a planting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub coordinator_id: String,
    pub approved: bool,
    pub signature_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}
