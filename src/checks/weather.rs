//! Weather and planting-season plausibility.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde_json::json;

use super::{failure_details, Checker};
use crate::domain::{CheckErrorKind, CheckResult, CheckerKind, PlantingEvidence};
use crate::infra::{Result, WeatherService};

/// Regional planting calendar, 1-based months.
#[derive(Debug, Clone)]
pub struct SeasonCalendar {
    pub optimal: Vec<u32>,
    pub acceptable: Vec<u32>,
    pub wet: Vec<u32>,
    pub optimal_score: f64,
    pub acceptable_score: f64,
    pub restricted_score: f64,
}

impl Default for SeasonCalendar {
    fn default() -> Self {
        Self {
            optimal: vec![3, 4, 5, 10, 11],
            acceptable: vec![6, 12],
            wet: vec![5, 6, 10, 11],
            optimal_score: 1.0,
            acceptable_score: 0.7,
            restricted_score: 0.3,
        }
    }
}

impl SeasonCalendar {
    pub fn score(&self, month: u32) -> f64 {
        if self.optimal.contains(&month) {
            self.optimal_score
        } else if self.acceptable.contains(&month) {
            self.acceptable_score
        } else {
            self.restricted_score
        }
    }

    pub fn label(&self, month: u32) -> &'static str {
        if self.optimal.contains(&month) {
            "optimal"
        } else if self.acceptable.contains(&month) {
            "acceptable"
        } else {
            "restricted"
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub max_rainfall_mm: f64,
    pub min_wet_season_humidity: f64,
    pub min_season_score: f64,
    pub calendar: SeasonCalendar,
    /// Offset of the planting region's standard time from UTC. Seasons
    /// follow the local calendar month.
    pub utc_offset_hours: i64,
}

impl WeatherConfig {
    pub fn local_month(&self, at: DateTime<Utc>) -> u32 {
        (at + chrono::Duration::hours(self.utc_offset_hours)).month()
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            min_temperature_c: 15.0,
            max_temperature_c: 35.0,
            max_rainfall_mm: 50.0,
            min_wet_season_humidity: 40.0,
            min_season_score: 0.7,
            calendar: SeasonCalendar::default(),
            utc_offset_hours: -5,
        }
    }
}

pub struct WeatherChecker {
    config: WeatherConfig,
    weather: Arc<dyn WeatherService>,
}

impl WeatherChecker {
    pub fn new(config: WeatherConfig, weather: Arc<dyn WeatherService>) -> Self {
        Self { config, weather }
    }
}

#[async_trait]
impl Checker for WeatherChecker {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Weather
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let at = evidence.claimed_at();
        let month = self.config.local_month(at);
        let season_score = self.config.calendar.score(month);

        let Some(location) = evidence.centroid() else {
            return Ok(CheckResult::pass(
                CheckerKind::Weather,
                season_score / 2.0,
                json!({ "suitable": true, "season": self.config.calendar.label(month) }),
            ));
        };

        let conditions = match self.weather.get_conditions(location, at).await {
            Ok(conditions) => conditions,
            Err(e) => {
                tracing::warn!(evidence_id = %evidence.id, error = %e, "Weather lookup failed");
                let message = format!("weather data unavailable: {e}");
                return Ok(
                    CheckResult::errored(CheckerKind::Weather, CheckErrorKind::Unavailable, &message)
                        .with_details(json!({
                            "suitable": true,
                            "season_score": season_score,
                            "warnings": [message],
                        })),
                );
            }
        };

        let mut warnings = Vec::new();
        if conditions.temperature_c > self.config.max_temperature_c {
            warnings.push("extreme heat".to_string());
        }
        if conditions.temperature_c < self.config.min_temperature_c {
            warnings.push("unusually cold".to_string());
        }
        if conditions.rainfall_mm > self.config.max_rainfall_mm {
            warnings.push("heavy rainfall".to_string());
        }
        let suitable = warnings.is_empty();

        if self.config.calendar.wet.contains(&month)
            && conditions.humidity_pct < self.config.min_wet_season_humidity
        {
            warnings.push("unusually dry conditions for the rainy season".to_string());
        }

        let passed = suitable && season_score >= self.config.min_season_score;
        let confidence = (season_score + if suitable { 1.0 } else { 0.0 }) / 2.0;
        let details = json!({
            "suitable": suitable,
            "season": self.config.calendar.label(month),
            "season_score": season_score,
            "conditions": conditions,
            "warnings": warnings,
        });

        Ok(if passed {
            CheckResult::pass(CheckerKind::Weather, confidence, details)
        } else if !suitable {
            CheckResult::fail(
                CheckerKind::Weather,
                confidence,
                failure_details("unsuitable_weather", "implausible planting weather", details),
            )
        } else {
            CheckResult::fail(
                CheckerKind::Weather,
                confidence,
                failure_details("off_season", "outside planting season", details),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::{evidence_at, KENSCOFF};
    use crate::domain::WeatherConditions;
    use crate::infra::{MockWeatherService, VerificationError};
    use chrono::{TimeZone, Utc};

    fn checker(temperature_c: f64, humidity_pct: f64, rainfall_mm: f64) -> WeatherChecker {
        let mut mock = MockWeatherService::new();
        mock.expect_get_conditions().returning(move |_, _| {
            Ok(WeatherConditions {
                temperature_c,
                humidity_pct,
                rainfall_mm,
            })
        });
        WeatherChecker::new(WeatherConfig::default(), Arc::new(mock))
    }

    fn evidence_in_month(month: u32) -> PlantingEvidence {
        let mut evidence = evidence_at(KENSCOFF, &[(0.0, 0.0)], 1);
        evidence.photos[0].captured_at = Utc.with_ymd_and_hms(2024, month, 10, 9, 0, 0).unwrap();
        evidence
    }

    #[test]
    fn season_calendar_scores() {
        let calendar = SeasonCalendar::default();
        assert_eq!(calendar.score(4), 1.0);
        assert_eq!(calendar.score(12), 0.7);
        assert_eq!(calendar.score(8), 0.3);
    }

    #[tokio::test]
    async fn mild_april_passes() {
        let result = checker(24.0, 70.0, 2.0).check(&evidence_in_month(4)).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn extreme_heat_fails_softly() {
        let result = checker(38.0, 70.0, 0.0).check(&evidence_in_month(4)).await.unwrap();
        assert!(!result.passed);
        assert!(!result.is_blocking_failure());
        assert_eq!(result.details["suitable"], false);
    }

    #[tokio::test]
    async fn restricted_month_fails() {
        let result = checker(24.0, 70.0, 0.0).check(&evidence_in_month(8)).await.unwrap();
        assert_eq!(result.reason_code(), Some("off_season"));
    }

    #[tokio::test]
    async fn dry_rainy_season_only_warns() {
        let result = checker(24.0, 20.0, 0.0).check(&evidence_in_month(10)).await.unwrap();
        assert!(result.passed);
        assert_eq!(
            result.details["warnings"][0],
            "unusually dry conditions for the rainy season"
        );
    }

    #[tokio::test]
    async fn season_follows_the_local_calendar() {
        // 21:00 on 29 February in Haiti is already March in UTC.
        let mut evidence = evidence_in_month(2);
        evidence.photos[0].captured_at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();

        let result = checker(24.0, 70.0, 0.0).check(&evidence).await.unwrap();
        assert_eq!(result.reason_code(), Some("off_season"));
        assert_eq!(result.details["season"], "restricted");
    }

    #[test]
    fn local_month_shifts_late_evening_back() {
        let config = WeatherConfig::default();
        let late = Utc.with_ymd_and_hms(2024, 12, 1, 3, 30, 0).unwrap();
        assert_eq!(config.local_month(late), 11);
        let morning = Utc.with_ymd_and_hms(2024, 12, 1, 14, 0, 0).unwrap();
        assert_eq!(config.local_month(morning), 12);
    }

    #[tokio::test]
    async fn api_failure_defaults_to_suitable() {
        let mut mock = MockWeatherService::new();
        mock.expect_get_conditions()
            .returning(|_, _| Err(VerificationError::collaborator("weather", "401")));
        let checker = WeatherChecker::new(WeatherConfig::default(), Arc::new(mock));

        let result = checker.check(&evidence_in_month(4)).await.unwrap();
        assert!(!result.participates());
        assert_eq!(result.details["suitable"], true);
        assert!(result.details["warnings"][0]
            .as_str()
            .unwrap()
            .starts_with("weather data unavailable"));
    }
}
