//! Rolling-window detector over a monitored series.

use async_trait::async_trait;
use serde_json::json;

use super::{mean_std, severity_band, AnomalyDetector};
use crate::domain::{AnomalyResult, OperationalEvent};

#[derive(Debug, Clone)]
pub struct TimeSeriesConfig {
    /// Points considered; shorter series are not evaluated.
    pub window: usize,
    pub z_threshold: f64,
    /// Points in the recent-slope fit.
    pub trend_tail: usize,
    /// Seasonal period in points (hourly data, daily season).
    pub period: usize,
    /// Relative deviation from the seasonal reference that counts as a break.
    pub seasonal_deviation: f64,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            window: 60,
            z_threshold: 2.5,
            trend_tail: 10,
            period: 24,
            seasonal_deviation: 0.5,
        }
    }
}

#[derive(Default)]
pub struct TimeSeriesDetector {
    config: TimeSeriesConfig,
}

/// Least-squares slope against the point index.
fn slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }
    (n * sum_xy - sum_x * sum_y) / (n * sum_x2 - sum_x * sum_x)
}

impl TimeSeriesDetector {
    pub fn new(config: TimeSeriesConfig) -> Self {
        Self { config }
    }

    fn z_score(&self, history: &[f64], current: f64) -> (f64, f64, f64) {
        let (mean, std_dev) = mean_std(history);
        let z = if std_dev > f64::EPSILON {
            ((current - mean) / std_dev).abs()
        } else if (current - mean).abs() > f64::EPSILON {
            // Any move off a perfectly flat history is maximal.
            self.config.z_threshold * 4.0
        } else {
            0.0
        };
        (z, mean, std_dev)
    }

    /// Recent slope departs from the overall slope by more than twice its
    /// magnitude.
    fn trend_break(&self, values: &[f64]) -> bool {
        let overall = slope(values);
        let tail = &values[values.len().saturating_sub(self.config.trend_tail)..];
        let recent = slope(tail);
        (recent - overall).abs() > overall.abs() * 2.0 + f64::EPSILON
    }

    /// Current value against the same phase one period earlier.
    fn seasonal_break(&self, values: &[f64]) -> bool {
        let period = self.config.period;
        let n = values.len();
        if period == 0 || n < period * 2 {
            return false;
        }
        let reference = &values[n - period - 1..n - period + 1];
        let expected = reference.iter().sum::<f64>() / reference.len() as f64;
        if expected.abs() <= f64::EPSILON {
            return false;
        }
        let current = values[n - 1];
        ((current - expected) / expected).abs() > self.config.seasonal_deviation
    }
}

#[async_trait]
impl AnomalyDetector for TimeSeriesDetector {
    fn name(&self) -> &'static str {
        "timeseries"
    }

    async fn detect(&self, event: &OperationalEvent) -> AnomalyResult {
        let series = event.series.as_deref().unwrap_or_default();
        if series.len() < self.config.window || self.config.window < 2 {
            return AnomalyResult {
                description: "Insufficient data".to_string(),
                ..AnomalyResult::clean(self.name())
            };
        }

        let values = &series[series.len() - self.config.window..];
        let current = values[values.len() - 1];
        let (z, mean, std_dev) = self.z_score(&values[..values.len() - 1], current);
        let trend = self.trend_break(values);
        let seasonal = self.seasonal_break(values);

        let confidence = f64::min(
            (z / self.config.z_threshold) * 0.4
                + if trend { 0.3 } else { 0.0 }
                + if seasonal { 0.3 } else { 0.0 },
            1.0,
        );

        let mut parts = Vec::new();
        if z > self.config.z_threshold {
            parts.push(format!("Value deviates {z:.2} standard deviations"));
        }
        if trend {
            parts.push("Trend change detected".to_string());
        }
        if seasonal {
            parts.push("Seasonality violation detected".to_string());
        }

        AnomalyResult {
            detector: self.name().to_string(),
            is_anomaly: !parts.is_empty(),
            confidence,
            severity: severity_band(confidence, 0.7, 0.4),
            description: if parts.is_empty() {
                "Normal time series behavior".to_string()
            } else {
                parts.join(", ")
            },
            metadata: json!({
                "z_score": z,
                "mean": mean,
                "std_dev": std_dev,
                "current": current,
                "trend_break": trend,
                "seasonal_break": seasonal,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;

    /// Alternating 100/102 with a steady daily shape.
    fn steady(len: usize) -> Vec<f64> {
        (0..len).map(|i| if i % 2 == 0 { 100.0 } else { 102.0 }).collect()
    }

    fn event(series: Vec<f64>) -> OperationalEvent {
        OperationalEvent {
            series: Some(series),
            ..OperationalEvent::new("ingest")
        }
    }

    #[tokio::test]
    async fn short_series_is_not_evaluated() {
        let result = TimeSeriesDetector::default().detect(&event(steady(30))).await;
        assert!(!result.is_anomaly);
        assert_eq!(result.description, "Insufficient data");
    }

    #[tokio::test]
    async fn spike_is_high_severity() {
        let mut series = steady(59);
        series.push(400.0);

        let result = TimeSeriesDetector::default().detect(&event(series)).await;
        assert!(result.is_anomaly);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.severity, Severity::High);
        assert_eq!(result.metadata["seasonal_break"], true);
    }

    #[test]
    fn slope_of_a_line() {
        assert!((slope(&[1.0, 3.0, 5.0, 7.0]) - 2.0).abs() < 1e-12);
        assert_eq!(slope(&[5.0]), 0.0);
    }

    #[test]
    fn seasonal_reference_is_one_period_back() {
        let detector = TimeSeriesDetector::default();
        let mut series = vec![10.0; 60];
        assert!(!detector.seasonal_break(&series));
        series[59] = 16.0;
        assert!(detector.seasonal_break(&series));
    }
}
