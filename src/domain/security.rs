//! Anomaly detection output and the security event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Severity shared by anomaly results and security events.
///
/// Detectors only ever emit `Low`..`High`; `Critical` is reserved for
/// events raised by the monitor itself (brute force, DDoS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Derived overall threat level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Numeric value exported as the `threat_level` gauge.
    pub fn as_gauge(&self) -> u64 {
        match self {
            ThreatLevel::Low => 0,
            ThreatLevel::Medium => 1,
            ThreatLevel::High => 2,
            ThreatLevel::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security event types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginAttempt,
    LoginSuccess,
    LoginFailure,
    SuspiciousLogin,
    RateLimitExceeded,
    DdosAttackDetected,
    BruteForceDetected,
    AnomalyDetected,
    UnauthorizedAccess,
    SuspiciousPattern,
    UnusualActivity,
    Custom(String),
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityEventType::LoginAttempt => write!(f, "login_attempt"),
            SecurityEventType::LoginSuccess => write!(f, "login_success"),
            SecurityEventType::LoginFailure => write!(f, "login_failure"),
            SecurityEventType::SuspiciousLogin => write!(f, "suspicious_login"),
            SecurityEventType::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            SecurityEventType::DdosAttackDetected => write!(f, "ddos_attack_detected"),
            SecurityEventType::BruteForceDetected => write!(f, "brute_force_detected"),
            SecurityEventType::AnomalyDetected => write!(f, "anomaly_detected"),
            SecurityEventType::UnauthorizedAccess => write!(f, "unauthorized_access"),
            SecurityEventType::SuspiciousPattern => write!(f, "suspicious_pattern"),
            SecurityEventType::UnusualActivity => write!(f, "unusual_activity"),
            SecurityEventType::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

impl SecurityEventType {
    /// Inverse of `Display`; unknown names become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "login_attempt" => SecurityEventType::LoginAttempt,
            "login_success" => SecurityEventType::LoginSuccess,
            "login_failure" => SecurityEventType::LoginFailure,
            "suspicious_login" => SecurityEventType::SuspiciousLogin,
            "rate_limit_exceeded" => SecurityEventType::RateLimitExceeded,
            "ddos_attack_detected" => SecurityEventType::DdosAttackDetected,
            "brute_force_detected" => SecurityEventType::BruteForceDetected,
            "anomaly_detected" => SecurityEventType::AnomalyDetected,
            "unauthorized_access" => SecurityEventType::UnauthorizedAccess,
            "suspicious_pattern" => SecurityEventType::SuspiciousPattern,
            "unusual_activity" => SecurityEventType::UnusualActivity,
            other => SecurityEventType::Custom(
                other.strip_prefix("custom:").unwrap_or(other).to_string(),
            ),
        }
    }
}

/// One entry of the append-only security event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    /// Originating IP, service or identity.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub resolved: bool,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            source: source.into(),
            target: None,
            description: description.into(),
            metadata: None,
            resolved: false,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Output of one anomaly detector for one operational event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub detector: String,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub severity: Severity,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl AnomalyResult {
    pub fn clean(detector: impl Into<String>) -> Self {
        Self {
            detector: detector.into(),
            is_anomaly: false,
            confidence: 0.0,
            severity: Severity::Low,
            description: String::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Operational event observed by the anomaly monitor. Covers planting
/// submissions as well as request and auth traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationalEvent {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// IP address or service name.
    pub source: String,
    /// Authenticated user or planter, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Set when the event is itself a security signal (login failure, rate
    /// limit hit); those are recorded verbatim on the event stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<SecurityEventType>,
    /// Application action name used for sequence checks (e.g. `payment_init`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Named numeric observations (`request_rate`, `error_rate`, ...).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Recent values of a monitored series, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<f64>>,
}

impl OperationalEvent {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn event_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
