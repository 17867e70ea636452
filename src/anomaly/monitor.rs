//! Security monitor
//!
//! Background service over the security event stream. It:
//!
//! 1. Runs every anomaly detector over incoming operational events
//! 2. Appends a security event for each result above the detector's threshold
//! 3. Raises brute-force and DDoS events from event counts per time window
//! 4. Recomputes the threat level on every event and every tick
//! 5. Sends alerts to the alert sink for critical events and volume spikes
//!
//! # Configuration
//!
//! - `MONITOR_TICK_INTERVAL_SECS` - Periodic analysis interval (default: 60)
//! - `ANOMALY_THRESHOLD` - Default detector confidence threshold (default: 0.7)
//! - `ANOMALY_THRESHOLD_<DETECTOR>` - Per-detector override, e.g. `ANOMALY_THRESHOLD_PATTERN`
//! - `ALERT_FAILED_LOGINS_PER_SOURCE` - Login failures per source in 5 minutes (default: 10)
//! - `ALERT_RATE_LIMIT_VIOLATIONS` - Rate limit hits in 10 minutes (default: 100)
//! - `ALERT_CRITICAL_EVENTS_PER_HOUR` - (default: 10)
//! - `ALERT_TOTAL_EVENTS_PER_HOUR` - (default: 500)
//! - `SECURITY_EVENT_RETENTION_HOURS` - In-memory window (default: 24)

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    AnomalyDetector, BehavioralDetector, PatternDetector, ProfileStore, StatisticalDetector,
    TimeSeriesDetector,
};
use crate::domain::{
    AnomalyResult, OperationalEvent, SecurityEvent, SecurityEventType, Severity, ThreatLevel,
};
use crate::infra::{
    AlertSink, AuditAction, AuditLogBuilder, AuditSink, Result, Retry, RetryConfig,
    SecurityEventStore, ShutdownSignal, VerificationError,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// Detector names with a per-detector threshold override.
const DETECTOR_NAMES: [&str; 4] = ["statistical", "pattern", "timeseries", "behavioral"];

/// Configuration for the security monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the periodic analysis runs
    pub tick_interval: Duration,
    /// Threshold for detectors without an override
    pub default_threshold: f64,
    /// Per-detector confidence thresholds
    pub detector_thresholds: HashMap<String, f64>,
    /// Login failures from one source before a brute-force event
    pub failed_logins_per_source: usize,
    pub failed_login_window: chrono::Duration,
    /// Rate limit violations (all sources) before a DDoS event
    pub rate_limit_violations: usize,
    pub rate_limit_window: chrono::Duration,
    pub critical_events_per_hour: usize,
    pub total_events_per_hour: usize,
    /// Events older than this leave the in-memory window
    pub retention: chrono::Duration,
    /// Current over previous hour volume that counts as unusual activity
    pub growth_ratio: f64,
    /// Minimum gap between two alerts of the same kind
    pub alert_cooldown: chrono::Duration,
    /// Buffered operational events between producers and the monitor task
    pub queue_capacity: usize,
    pub alert_retry: RetryConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            default_threshold: 0.7,
            detector_thresholds: HashMap::new(),
            failed_logins_per_source: 10,
            failed_login_window: chrono::Duration::minutes(5),
            rate_limit_violations: 100,
            rate_limit_window: chrono::Duration::minutes(10),
            critical_events_per_hour: 10,
            total_events_per_hour: 500,
            retention: chrono::Duration::hours(24),
            growth_ratio: 2.0,
            alert_cooldown: chrono::Duration::minutes(5),
            queue_capacity: 1024,
            alert_retry: RetryConfig::alert_delivery(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tick_interval = std::env::var("MONITOR_TICK_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tick_interval);

        let default_threshold = std::env::var("ANOMALY_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.default_threshold);

        let detector_thresholds = DETECTOR_NAMES
            .iter()
            .filter_map(|name| {
                std::env::var(format!("ANOMALY_THRESHOLD_{}", name.to_uppercase()))
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .map(|threshold| (name.to_string(), threshold))
            })
            .collect();

        let failed_logins_per_source = std::env::var("ALERT_FAILED_LOGINS_PER_SOURCE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.failed_logins_per_source);

        let rate_limit_violations = std::env::var("ALERT_RATE_LIMIT_VIOLATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.rate_limit_violations);

        let critical_events_per_hour = std::env::var("ALERT_CRITICAL_EVENTS_PER_HOUR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.critical_events_per_hour);

        let total_events_per_hour = std::env::var("ALERT_TOTAL_EVENTS_PER_HOUR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.total_events_per_hour);

        let retention = std::env::var("SECURITY_EVENT_RETENTION_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(chrono::Duration::hours)
            .unwrap_or(defaults.retention);

        Self {
            tick_interval,
            default_threshold,
            detector_thresholds,
            failed_logins_per_source,
            rate_limit_violations,
            critical_events_per_hour,
            total_events_per_hour,
            retention,
            ..defaults
        }
    }

    pub fn threshold_for(&self, detector: &str) -> f64 {
        self.detector_thresholds
            .get(detector)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// Threat level from the last hour's critical count, high count and volume.
pub fn assess_threat(critical: usize, high: usize, hourly: usize) -> ThreatLevel {
    if critical > 5 || hourly > 1000 {
        ThreatLevel::Critical
    } else if critical > 0 || high > 10 || hourly > 500 {
        ThreatLevel::High
    } else if high > 0 || hourly > 100 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

/// Severity recorded for a security signal reported directly by a producer.
fn default_severity(event_type: &SecurityEventType) -> Severity {
    match event_type {
        SecurityEventType::LoginAttempt | SecurityEventType::LoginSuccess => Severity::Low,
        SecurityEventType::LoginFailure
        | SecurityEventType::RateLimitExceeded
        | SecurityEventType::AnomalyDetected
        | SecurityEventType::UnusualActivity => Severity::Medium,
        SecurityEventType::SuspiciousLogin
        | SecurityEventType::UnauthorizedAccess
        | SecurityEventType::SuspiciousPattern => Severity::High,
        SecurityEventType::DdosAttackDetected | SecurityEventType::BruteForceDetected => {
            Severity::Critical
        }
        SecurityEventType::Custom(_) => Severity::Low,
    }
}

/// Cheap handle for producers; events are queued for the monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<OperationalEvent>,
}

impl MonitorHandle {
    /// Queue an event. Returns false when the queue is full or the monitor
    /// has stopped; the event is dropped, producers never wait on it.
    pub fn observe(&self, event: OperationalEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Security monitor queue full, dropping operational event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Security monitor stopped, dropping operational event");
                false
            }
        }
    }
}

/// Security monitor
pub struct SecurityMonitor {
    config: MonitorConfig,
    detectors: Vec<Arc<dyn AnomalyDetector>>,
    store: Arc<dyn SecurityEventStore>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<dyn AuditSink>,
    /// Recent events, oldest first
    window: RwLock<VecDeque<SecurityEvent>>,
    threat: RwLock<ThreatLevel>,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SecurityMonitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn SecurityEventStore>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<MetricsRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            detectors: Vec::new(),
            store,
            alerts,
            metrics,
            audit,
            window: RwLock::new(VecDeque::new()),
            threat: RwLock::new(ThreatLevel::Low),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn AnomalyDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Statistical, pattern, time-series and behavioral detectors sharing one
    /// profile store.
    pub fn with_default_detectors(self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.with_detector(Arc::new(StatisticalDetector::new()))
            .with_detector(Arc::new(PatternDetector::new(profiles.clone())))
            .with_detector(Arc::new(TimeSeriesDetector::default()))
            .with_detector(Arc::new(BehavioralDetector::new(profiles)))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn threat_level(&self) -> ThreatLevel {
        *self.threat.read().await
    }

    /// Run every detector over `event` and record the resulting security
    /// events. Returns the events recorded.
    #[instrument(skip(self, event), fields(source = %event.source))]
    pub async fn observe(&self, event: OperationalEvent) -> Result<Vec<SecurityEvent>> {
        let mut recorded = Vec::new();

        if let Some(event_type) = &event.event_type {
            let description = event
                .path
                .clone()
                .unwrap_or_else(|| event_type.to_string());
            let mut signal = SecurityEvent::new(
                event_type.clone(),
                default_severity(event_type),
                event.source.clone(),
                description,
            )
            .at(event.timestamp);
            if let Some(identity) = &event.identity {
                signal = signal.with_target(identity.clone());
            }
            recorded.extend(self.record_event(signal).await?);
        }

        for detector in &self.detectors {
            let result = detector.detect(&event).await;
            let threshold = self.config.threshold_for(detector.name());
            if !result.is_anomaly || result.confidence < threshold {
                continue;
            }
            recorded.extend(self.record_event(anomaly_event(&event, result)).await?);
        }

        Ok(recorded)
    }

    /// Append an event to the stream, plus any brute-force or DDoS event it
    /// completes. Returns every event appended.
    pub async fn record_event(&self, event: SecurityEvent) -> Result<Vec<SecurityEvent>> {
        let mut recorded = vec![event];
        if let Some(derived) = self.derived_event(&recorded[0]).await {
            recorded.push(derived);
        }

        // Derived events are appended after their trigger.
        for event in &recorded {
            self.persist(event).await?;
            self.check_alerts(event).await;
        }
        Ok(recorded)
    }

    async fn persist(&self, event: &SecurityEvent) -> Result<()> {
        self.store.append(event).await?;
        self.window.write().await.push_back(event.clone());

        self.metrics
            .inc_counter(metric_names::SECURITY_EVENTS_TOTAL)
            .await;
        self.refresh_threat_level().await;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            source = %event.source,
            "Security event recorded: {}",
            event.description
        );
        Ok(())
    }

    /// Brute-force and DDoS detection from recent counts.
    async fn derived_event(&self, trigger: &SecurityEvent) -> Option<SecurityEvent> {
        match trigger.event_type {
            SecurityEventType::LoginFailure => {
                let failures = self
                    .count_recent(
                        &SecurityEventType::LoginFailure,
                        Some(&trigger.source),
                        self.config.failed_login_window,
                    )
                    .await
                    + 1;
                if failures <= self.config.failed_logins_per_source
                    || !self.cooled_down(&format!("brute-force:{}", trigger.source)).await
                {
                    return None;
                }
                Some(
                    SecurityEvent::new(
                        SecurityEventType::BruteForceDetected,
                        Severity::Critical,
                        trigger.source.clone(),
                        format!("{failures} failed login attempts from {}", trigger.source),
                    )
                    .with_metadata(json!({ "failures": failures })),
                )
            }
            SecurityEventType::RateLimitExceeded => {
                let violations = self
                    .count_recent(
                        &SecurityEventType::RateLimitExceeded,
                        None,
                        self.config.rate_limit_window,
                    )
                    .await
                    + 1;
                if violations <= self.config.rate_limit_violations
                    || !self.cooled_down("ddos").await
                {
                    return None;
                }
                Some(
                    SecurityEvent::new(
                        SecurityEventType::DdosAttackDetected,
                        Severity::Critical,
                        "monitor",
                        format!("{violations} rate limit violations in 10 minutes"),
                    )
                    .with_metadata(json!({ "violations": violations })),
                )
            }
            _ => None,
        }
    }

    async fn check_alerts(&self, event: &SecurityEvent) {
        if event.severity == Severity::Critical {
            self.alert(event).await;
        }

        let (critical, _, hourly) = self.hourly_counts().await;
        if hourly > self.config.total_events_per_hour && self.cooled_down("volume").await {
            let alert = SecurityEvent::new(
                SecurityEventType::UnusualActivity,
                Severity::High,
                "monitor",
                format!(
                    "{hourly} events in the last hour (threshold: {})",
                    self.config.total_events_per_hour
                ),
            );
            self.alert(&alert).await;
        }
        if critical > self.config.critical_events_per_hour
            && self.cooled_down("critical-volume").await
        {
            let alert = SecurityEvent::new(
                SecurityEventType::UnusualActivity,
                Severity::Critical,
                "monitor",
                format!(
                    "{critical} critical events in the last hour (threshold: {})",
                    self.config.critical_events_per_hour
                ),
            );
            self.alert(&alert).await;
        }
    }

    /// Deliver to the alert sink with retries. Delivery failure is logged;
    /// the event itself is already on the stream.
    async fn alert(&self, event: &SecurityEvent) {
        warn!(
            event_type = %event.event_type,
            severity = %event.severity,
            "Security alert: {}",
            event.description
        );

        let retry = Retry::new(self.config.alert_retry.clone());
        let outcome = retry
            .run("security alert", || self.alerts.raise_alert(event))
            .await;

        let mut entry = AuditLogBuilder::system(AuditAction::AlertRaised)
            .resource("security_event", event.id.to_string())
            .details(json!({
                "event_type": event.event_type.to_string(),
                "severity": event.severity,
                "attempts": outcome.attempts,
            }));
        match outcome.result {
            Ok(()) => {
                self.metrics.inc_counter(metric_names::ALERTS_RAISED).await;
            }
            Err(e) => {
                error!(error = %e, event_id = %event.id, "Alert delivery failed");
                entry = entry.failed(e.to_string());
            }
        }
        if let Err(e) = self.audit.record(entry.build()).await {
            warn!(error = %e, "Failed to audit alert");
        }
    }

    /// True at most once per cooldown period for each key.
    async fn cooled_down(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut last = self.last_alert.lock().await;
        match last.get(key) {
            Some(at) if now - *at < self.config.alert_cooldown => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    async fn count_recent(
        &self,
        event_type: &SecurityEventType,
        source: Option<&str>,
        window: chrono::Duration,
    ) -> usize {
        let cutoff = Utc::now() - window;
        self.window
            .read()
            .await
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .filter(|e| &e.event_type == event_type)
            .filter(|e| source.map_or(true, |s| e.source == s))
            .count()
    }

    /// (critical, high, total) over the last hour.
    async fn hourly_counts(&self) -> (usize, usize, usize) {
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let window = self.window.read().await;
        let recent: Vec<&SecurityEvent> = window.iter().filter(|e| e.timestamp > cutoff).collect();
        let critical = recent
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count();
        let high = recent.iter().filter(|e| e.severity == Severity::High).count();
        (critical, high, recent.len())
    }

    async fn refresh_threat_level(&self) -> ThreatLevel {
        let (critical, high, hourly) = self.hourly_counts().await;
        let level = assess_threat(critical, high, hourly);

        let previous = std::mem::replace(&mut *self.threat.write().await, level);
        if previous != level {
            info!(from = %previous, to = %level, "Threat level changed");
        }
        self.metrics
            .set_gauge(metric_names::THREAT_LEVEL, level.as_gauge())
            .await;
        level
    }

    /// Periodic analysis: prune the window, recompute the threat level and
    /// alert on hour-over-hour growth.
    pub async fn tick(&self) {
        let now = Utc::now();
        let (current, previous) = {
            let mut window = self.window.write().await;
            // Producers stamp their own events, so the window is not in
            // timestamp order.
            let cutoff = now - self.config.retention;
            window.retain(|e| e.timestamp >= cutoff);

            let hour_ago = now - chrono::Duration::hours(1);
            let two_hours_ago = now - chrono::Duration::hours(2);
            let current = window.iter().filter(|e| e.timestamp > hour_ago).count();
            let previous = window
                .iter()
                .filter(|e| e.timestamp > two_hours_ago && e.timestamp <= hour_ago)
                .count();
            (current, previous)
        };

        let level = self.refresh_threat_level().await;
        let growth = current as f64 / previous.max(1) as f64;
        debug!(current, previous, growth, threat_level = %level, "Security monitor tick");

        if growth > self.config.growth_ratio && self.cooled_down("growth").await {
            let alert = SecurityEvent::new(
                SecurityEventType::UnusualActivity,
                Severity::High,
                "monitor",
                format!(
                    "Event rate increased by {}%",
                    ((growth - 1.0) * 100.0).round()
                ),
            )
            .with_metadata(json!({ "current_hour": current, "previous_hour": previous }));
            self.alert(&alert).await;
        }
    }

    pub async fn events_since(
        &self,
        since: DateTime<Utc>,
        severity: Option<Severity>,
        limit: u32,
    ) -> Result<Vec<SecurityEvent>> {
        self.store.since(since, severity, limit).await
    }

    /// Mark an event resolved on the stream.
    pub async fn resolve(&self, id: Uuid, actor: &str) -> Result<()> {
        if !self.store.resolve(id).await? {
            return Err(VerificationError::EventNotFound(id));
        }
        if let Some(event) = self.window.write().await.iter_mut().find(|e| e.id == id) {
            event.resolved = true;
        }

        let entry = AuditLogBuilder::new(AuditAction::SecurityEventResolved, actor, "admin")
            .resource("security_event", id.to_string())
            .build();
        self.audit.record(entry).await?;
        info!(event_id = %id, actor, "Security event resolved");
        Ok(())
    }

    /// Run the monitor on its own task until shutdown. Queued events are
    /// drained before the task exits.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> (MonitorHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity.max(1));

        let task = tokio::spawn(async move {
            info!(
                tick_secs = self.config.tick_interval.as_secs(),
                detectors = self.detectors.len(),
                "Starting security monitor"
            );
            let mut ticker = interval(self.config.tick_interval);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        while let Ok(event) = rx.try_recv() {
                            self.observe_logged(event).await;
                        }
                        info!("Security monitor shutting down");
                        break;
                    }
                    Some(event) = rx.recv() => {
                        self.observe_logged(event).await;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        });

        (MonitorHandle { tx }, task)
    }

    async fn observe_logged(&self, event: OperationalEvent) {
        if let Err(e) = self.observe(event).await {
            error!(error = %e, "Failed to process operational event");
        }
    }
}

fn anomaly_event(event: &OperationalEvent, result: AnomalyResult) -> SecurityEvent {
    let mut security = SecurityEvent::new(
        SecurityEventType::AnomalyDetected,
        result.severity,
        event.source.clone(),
        result.description.clone(),
    )
    .at(event.timestamp)
    .with_metadata(json!({
        "detector": result.detector,
        "confidence": result.confidence,
        "details": result.metadata,
    }));
    if let Some(identity) = &event.identity {
        security = security.with_target(identity.clone());
    }
    security
}
