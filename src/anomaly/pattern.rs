//! Injection signatures and impossible action sequences.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use super::{severity_band, AnomalyDetector, ProfileStore};
use crate::domain::{AnomalyResult, OperationalEvent};

/// (previous action, next action) pairs that cannot legitimately follow
/// each other.
const IMPOSSIBLE_SEQUENCES: [(&str, &str); 3] = [
    ("logout", "authenticated_action"),
    ("payment_success", "payment_init"),
    ("verify_2fa", "login"),
];

const SIGNATURE_WEIGHT: f64 = 0.3;
const SEQUENCE_WEIGHT: f64 = 0.4;

struct SignatureFamily {
    name: &'static str,
    patterns: Vec<Regex>,
}

impl SignatureFamily {
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

pub struct PatternDetector {
    families: Vec<SignatureFamily>,
    profiles: Arc<dyn ProfileStore>,
}

impl PatternDetector {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        let family = |name: &'static str, sources: &[&str]| SignatureFamily {
            name,
            patterns: sources.iter().filter_map(|s| Regex::new(s).ok()).collect(),
        };

        Self {
            families: vec![
                family(
                    "sql_injection",
                    &[
                        r"(?i)\b(union|select|insert|update|delete|drop|create)\b.*\b(from|where|table)\b",
                        r"(?i)\b(or|and)\b\s*\d+\s*=\s*\d+",
                        r"(--|#|/\*|\*/)",
                    ],
                ),
                family(
                    "xss",
                    &[r"(?is)<script[^>]*>.*?</script>", r"(?i)javascript:", r"(?i)on\w+\s*="],
                ),
                family("path_traversal", &[r"\.\.(/|\\)", r"(?i)etc/(passwd|shadow)"]),
                family(
                    "command_injection",
                    &[r"(?i)[;&|`]\s*(ls|cat|rm|wget|curl|nc|bash|sh)\b", r"\$\(.+\)"],
                ),
            ],
            profiles,
        }
    }

    fn signatures(&self, event: &OperationalEvent) -> BTreeSet<&'static str> {
        let texts = [event.path.as_deref(), event.body.as_deref()];
        self.families
            .iter()
            .filter(|f| texts.iter().flatten().any(|t| f.matches(t)))
            .map(|f| f.name)
            .collect()
    }

    /// Whether `action` is impossible after `previous` (oldest first).
    fn impossible(previous: &[String], action: &str) -> bool {
        if let Some(last) = previous.last() {
            if IMPOSSIBLE_SEQUENCES
                .iter()
                .any(|(prev, next)| last == prev && action == *next)
            {
                return true;
            }
        }

        // A payment can only succeed after it was confirmed.
        if action == "payment_success" {
            if let Some(init) = previous.iter().rposition(|a| a == "payment_init") {
                return !previous[init + 1..].iter().any(|a| a == "payment_confirm");
            }
        }
        false
    }
}

#[async_trait]
impl AnomalyDetector for PatternDetector {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn detect(&self, event: &OperationalEvent) -> AnomalyResult {
        let mut detected: Vec<&str> = self.signatures(event).into_iter().collect();
        let mut score = SIGNATURE_WEIGHT * detected.len() as f64;

        if let Some(action) = &event.action {
            let identity = event.identity.as_deref().unwrap_or(&event.source);
            let previous = self.profiles.push_action(identity, action).await;
            if Self::impossible(&previous, action) {
                detected.push("sequence_anomaly");
                score += SEQUENCE_WEIGHT;
            }
        }

        let confidence = f64::min(score, 1.0);
        let is_anomaly = !detected.is_empty();
        AnomalyResult {
            detector: self.name().to_string(),
            is_anomaly,
            confidence,
            severity: severity_band(confidence, 0.7, 0.4),
            description: if is_anomaly {
                format!("Suspicious patterns detected: {}", detected.join(", "))
            } else {
                "No suspicious patterns".to_string()
            },
            metadata: json!({ "detected_patterns": detected }),
        }
    }
}
