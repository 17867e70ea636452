//! Anomaly and behavioral monitoring
//!
//! Detectors run over a stream of operational events (planting submissions,
//! request and auth traffic) independently of the verification decision.
//! Crossing a detector's threshold appends a [`SecurityEvent`] to the
//! stream; the [`SecurityMonitor`] derives the threat level from that stream
//! and raises alerts.
//!
//! [`SecurityEvent`]: crate::domain::SecurityEvent

mod behavioral;
mod monitor;
mod pattern;
mod profile;
mod statistical;
mod timeseries;

pub use behavioral::BehavioralDetector;
pub use monitor::{assess_threat, MonitorConfig, MonitorHandle, SecurityMonitor};
pub use pattern::PatternDetector;
pub use profile::{IdentityProfile, InMemoryProfileStore, ProfileStore};
pub use statistical::{MetricBaseline, StatisticalDetector};
pub use timeseries::{TimeSeriesConfig, TimeSeriesDetector};

#[cfg(test)]
pub use profile::MockProfileStore;

use async_trait::async_trait;

use crate::domain::{AnomalyResult, OperationalEvent, Severity};

/// One anomaly detection strategy.
#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, event: &OperationalEvent) -> AnomalyResult;
}

/// Map a summed confidence to a severity band: above `high` is High, above
/// `medium` is Medium.
pub(crate) fn severity_band(confidence: f64, high: f64, medium: f64) -> Severity {
    if confidence > high {
        Severity::High
    } else if confidence > medium {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Population mean and standard deviation.
pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
