//! Per-identity deviation from established behavior.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use serde_json::json;

use super::{severity_band, AnomalyDetector, IdentityProfile, ProfileStore};
use crate::domain::{AnomalyResult, OperationalEvent};

/// Locations known before a new one counts as a deviation.
const ESTABLISHED_LOCATIONS: usize = 3;
/// Distinct access hours observed before an unseen hour counts.
const ESTABLISHED_HOURS: usize = 10;
const RATE_MULTIPLIER: f64 = 3.0;

pub struct BehavioralDetector {
    profiles: Arc<dyn ProfileStore>,
    sensitive_resources: Vec<String>,
}

impl BehavioralDetector {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            sensitive_resources: vec![
                "/admin".to_string(),
                "/api/internal".to_string(),
                "/debug".to_string(),
            ],
        }
    }

    pub fn with_sensitive_resources(mut self, resources: Vec<String>) -> Self {
        self.sensitive_resources = resources;
        self
    }

    fn deviations(&self, profile: &IdentityProfile, event: &OperationalEvent) -> Vec<(&'static str, f64)> {
        let mut found = Vec::new();

        if let Some(location) = &event.location {
            if profile.locations.len() >= ESTABLISHED_LOCATIONS && !profile.locations.contains(location) {
                found.push(("Unusual login location", 0.3));
            }
        }

        let hour = event.timestamp.hour();
        if profile.access_hours.len() >= ESTABLISHED_HOURS && !profile.access_hours.contains(&hour) {
            found.push(("Unusual access time", 0.2));
        }

        if let Some(count) = event.metrics.get("request_count") {
            let average = profile.average_request_rate();
            if average > 0.0 && *count > average * RATE_MULTIPLIER {
                found.push(("Abnormal activity rate", 0.3));
            }
        }

        if let Some(resource) = &event.resource {
            let sensitive = self
                .sensitive_resources
                .iter()
                .any(|s| resource.contains(s.as_str()));
            if !profile.resources.is_empty() && sensitive && !profile.resources.contains(resource) {
                found.push(("Unusual resource access", 0.2));
            }
        }

        found
    }
}

#[async_trait]
impl AnomalyDetector for BehavioralDetector {
    fn name(&self) -> &'static str {
        "behavioral"
    }

    async fn detect(&self, event: &OperationalEvent) -> AnomalyResult {
        let identity = event.identity.as_deref().unwrap_or(&event.source);
        if identity.is_empty() {
            return AnomalyResult {
                description: "No identity".to_string(),
                ..AnomalyResult::clean(self.name())
            };
        }

        let profile = self.profiles.snapshot(identity).await;
        let found = self.deviations(&profile, event);
        self.profiles.record(identity, event).await;

        let confidence = f64::min(found.iter().map(|(_, w)| w).sum(), 1.0);
        let labels: Vec<&str> = found.iter().map(|(label, _)| *label).collect();
        AnomalyResult {
            detector: self.name().to_string(),
            is_anomaly: !found.is_empty(),
            confidence,
            severity: severity_band(confidence, 0.6, 0.3),
            description: if found.is_empty() {
                "Normal behavior".to_string()
            } else {
                format!("Behavioral anomalies: {}", labels.join(", "))
            },
            metadata: json!({ "anomalies": labels, "identity": identity }),
        }
    }
}
