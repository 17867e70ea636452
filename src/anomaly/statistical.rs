//! Z-score detector over named metrics.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use super::{mean_std, severity_band, AnomalyDetector};
use crate::domain::{AnomalyResult, OperationalEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricBaseline {
    pub mean: f64,
    pub std_dev: f64,
}

/// Compares each metric on an event against a trained baseline.
///
/// A deviation of at least 3σ contributes 0.3, at least 2σ contributes 0.2.
/// Metrics without a baseline (or with zero spread) are ignored.
#[derive(Default)]
pub struct StatisticalDetector {
    baselines: RwLock<HashMap<String, MetricBaseline>>,
}

impl StatisticalDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the baselines with statistics over `samples`.
    pub async fn train(&self, samples: &[BTreeMap<String, f64>]) {
        let mut series: HashMap<&str, Vec<f64>> = HashMap::new();
        for sample in samples {
            for (name, value) in sample {
                series.entry(name.as_str()).or_default().push(*value);
            }
        }

        let baselines = series
            .into_iter()
            .map(|(name, values)| {
                let (mean, std_dev) = mean_std(&values);
                (name.to_string(), MetricBaseline { mean, std_dev })
            })
            .collect();
        *self.baselines.write().await = baselines;
    }

    pub async fn set_baseline(&self, metric: impl Into<String>, baseline: MetricBaseline) {
        self.baselines.write().await.insert(metric.into(), baseline);
    }
}

#[async_trait]
impl AnomalyDetector for StatisticalDetector {
    fn name(&self) -> &'static str {
        "statistical"
    }

    async fn detect(&self, event: &OperationalEvent) -> AnomalyResult {
        let baselines = self.baselines.read().await;
        let mut score = 0.0;
        let mut deviations = Vec::new();

        for (metric, value) in &event.metrics {
            let Some(baseline) = baselines.get(metric) else {
                continue;
            };
            if baseline.std_dev <= f64::EPSILON {
                continue;
            }
            let z = ((value - baseline.mean) / baseline.std_dev).abs();
            if z >= 3.0 {
                score += 0.3;
            } else if z >= 2.0 {
                score += 0.2;
            } else {
                continue;
            }
            deviations.push(format!("{metric}: {z:.2} std devs"));
        }

        let is_anomaly = score > 0.5;
        let confidence = f64::min(score, 1.0);
        AnomalyResult {
            detector: self.name().to_string(),
            is_anomaly,
            confidence,
            severity: severity_band(score, 0.8, 0.5),
            description: if is_anomaly {
                format!("Statistical anomaly detected: {}", deviations.join(", "))
            } else {
                "No anomaly".to_string()
            },
            metadata: json!({ "deviations": deviations, "metrics": event.metrics }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;

    fn sample(rate: f64, errors: f64, latency: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("request_rate".to_string(), rate),
            ("error_rate".to_string(), errors),
            ("response_time".to_string(), latency),
        ])
    }

    async fn trained() -> StatisticalDetector {
        let detector = StatisticalDetector::new();
        detector
            .train(&[
                sample(90.0, 0.01, 100.0),
                sample(110.0, 0.03, 140.0),
                sample(100.0, 0.02, 120.0),
                sample(100.0, 0.02, 120.0),
            ])
            .await;
        detector
    }

    #[tokio::test]
    async fn normal_traffic_is_clean() {
        let detector = trained().await;
        let event = OperationalEvent::new("api")
            .metric("request_rate", 104.0)
            .metric("error_rate", 0.02);

        let result = detector.detect(&event).await;
        assert!(!result.is_anomaly);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn several_extreme_metrics_are_anomalous() {
        let detector = trained().await;
        let event = OperationalEvent::new("api")
            .metric("request_rate", 400.0)
            .metric("error_rate", 0.5)
            .metric("response_time", 2_000.0);

        let result = detector.detect(&event).await;
        assert!(result.is_anomaly);
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.severity, Severity::High);
    }

    #[tokio::test]
    async fn untrained_metrics_are_ignored() {
        let detector = StatisticalDetector::new();
        detector
            .set_baseline("cpu", MetricBaseline { mean: 0.4, std_dev: 0.0 })
            .await;
        let result = detector
            .detect(&OperationalEvent::new("api").metric("cpu", 0.99).metric("memory", 9.0))
            .await;
        assert!(!result.is_anomaly);
    }
}
