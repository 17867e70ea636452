//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use planting_verifier::anomaly::{InMemoryProfileStore, MonitorConfig, SecurityMonitor};
use planting_verifier::checks::{
    Checker, DctPerceptualHasher, DuplicateConfig, DuplicateDetector, ZoneCatalog,
};
use planting_verifier::domain::{
    default_zones, CheckResult, CheckerKind, EvidenceId, GeoPoint, Photo, PlanterId,
    PlantingEvidence,
};
use planting_verifier::infra::{
    InMemoryAuditLog, InMemoryHashIndex, InMemoryPlantingHistory, InMemorySecurityEventStore,
    InMemoryStore, LoggingAlertSink, PhotoStorage, Result, RetryConfig, RewardIssuer,
    VerificationError,
};
use planting_verifier::metrics::MetricsRegistry;
use planting_verifier::pipeline::{EvidenceSubmission, PipelineConfig, VerificationService};
use planting_verifier::server::AppState;

/// Inside the Kenscoff default zone.
pub const KENSCOFF: GeoPoint = GeoPoint::new(18.4431, -72.2891);

// ============================================================================
// Stub checkers
// ============================================================================

/// What a stub checker answers with.
#[derive(Debug, Clone)]
pub enum Behavior {
    Pass,
    Fail(&'static str),
    /// Failure caused by bad reference data.
    FailDataQuality(&'static str),
    /// Collaborator outage.
    Unavailable,
    /// Never answers.
    Hang,
}

pub struct StubChecker {
    kind: CheckerKind,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl StubChecker {
    pub fn new(kind: CheckerKind) -> Self {
        Self {
            kind,
            behavior: Mutex::new(Behavior::Pass),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checker for StubChecker {
    fn kind(&self) -> CheckerKind {
        self.kind
    }

    async fn check(&self, _evidence: &PlantingEvidence) -> Result<CheckResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Pass => Ok(CheckResult::pass(self.kind, 0.9, json!({}))),
            Behavior::Fail(reason) => Ok(CheckResult::fail(
                self.kind,
                0.9,
                json!({ "reason_code": "stub_failure", "reason": reason }),
            )),
            Behavior::FailDataQuality(reason) => Ok(CheckResult::fail(
                self.kind,
                1.0,
                json!({ "reason_code": "zone_ambiguous", "reason": reason }),
            )
            .with_data_quality()),
            Behavior::Unavailable => Err(VerificationError::collaborator(
                self.kind.as_str(),
                "503 Service Unavailable",
            )),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CheckResult::pass(self.kind, 0.9, json!({})))
            }
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Photo storage that serves the content hash itself as the image bytes, so
/// equal hashes fingerprint equally.
pub struct EchoStorage;

#[async_trait]
impl PhotoStorage for EchoStorage {
    async fn get_bytes(&self, content_hash: &str) -> Result<Vec<u8>> {
        Ok(content_hash.as_bytes().to_vec())
    }
}

/// Reward issuer that records every notification.
#[derive(Default)]
pub struct RecordingRewards {
    issued: Mutex<Vec<(EvidenceId, String, u32)>>,
}

impl RecordingRewards {
    pub fn issued(&self) -> Vec<(EvidenceId, String, u32)> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl RewardIssuer for RecordingRewards {
    async fn on_verified(
        &self,
        evidence_id: EvidenceId,
        planter_id: &PlanterId,
        trees_verified: u32,
    ) -> Result<()> {
        self.issued.lock().unwrap().push((
            evidence_id,
            planter_id.as_str().to_string(),
            trees_verified,
        ));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Short deadlines so timeout paths finish quickly.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        soft_timeout: Duration::from_millis(200),
        hard_timeout: Duration::from_millis(200),
        submission_timeout: Duration::from_secs(2),
        reward_retry: RetryConfig::fast(),
        ..PipelineConfig::default()
    }
}

/// A verification service over in-memory stores. The duplicate check is
/// the real detector; every other checker is a stub that passes until told
/// otherwise.
pub struct Harness {
    pub service: Arc<VerificationService>,
    pub store: Arc<InMemoryStore>,
    pub audit: Arc<InMemoryAuditLog>,
    pub rewards: Arc<RecordingRewards>,
    pub index: Arc<InMemoryHashIndex>,
    pub history: Arc<InMemoryPlantingHistory>,
    pub metrics: Arc<MetricsRegistry>,
    stubs: HashMap<CheckerKind, Arc<StubChecker>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self::with_checkers(config, Vec::new())
    }

    /// Like `with_config`, with real checkers standing in for the stubs of
    /// the same kind.
    pub fn with_checkers(config: PipelineConfig, real: Vec<Arc<dyn Checker>>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let rewards = Arc::new(RecordingRewards::default());
        let index = Arc::new(InMemoryHashIndex::new());
        let history = Arc::new(InMemoryPlantingHistory::new());
        let metrics = Arc::new(MetricsRegistry::new());

        let duplicate = Arc::new(DuplicateDetector::new(
            DuplicateConfig::default(),
            Arc::new(EchoStorage),
            Arc::new(DctPerceptualHasher),
            index.clone(),
            history.clone(),
        ));

        let stubs: HashMap<CheckerKind, Arc<StubChecker>> = [
            CheckerKind::Geospatial,
            CheckerKind::Satellite,
            CheckerKind::Photo,
            CheckerKind::Weather,
            CheckerKind::Temporal,
        ]
        .into_iter()
        .map(|kind| (kind, Arc::new(StubChecker::new(kind))))
        .collect();

        let mut builder = VerificationService::builder(config)
            .checker(duplicate.clone())
            .ledger(duplicate)
            .evidence_store(store.clone())
            .log_store(store.clone())
            .rewards(rewards.clone())
            .audit(audit.clone())
            .metrics(metrics.clone());
        for stub in stubs.values() {
            builder = builder.checker(stub.clone());
        }
        for checker in real {
            builder = builder.checker(checker);
        }
        let service = Arc::new(builder.build().expect("service should build"));

        Self {
            service,
            store,
            audit,
            rewards,
            index,
            history,
            metrics,
            stubs,
        }
    }

    pub fn stub(&self, kind: CheckerKind) -> &StubChecker {
        self.stubs
            .get(&kind)
            .map(Arc::as_ref)
            .expect("no stub for this checker")
    }

    /// Submit and return the stored evidence.
    pub async fn submit(&self, planter: &str, hashes: &[&str]) -> PlantingEvidence {
        self.service
            .submit(submission(planter, hashes))
            .await
            .expect("submission should be accepted")
    }
}

/// Security monitor over in-memory stores with the default detectors.
pub fn test_monitor(metrics: Arc<MetricsRegistry>) -> Arc<SecurityMonitor> {
    let config = MonitorConfig {
        alert_retry: RetryConfig::fast().with_max_retries(0),
        ..MonitorConfig::default()
    };
    Arc::new(
        SecurityMonitor::new(
            config,
            Arc::new(InMemorySecurityEventStore::new()),
            Arc::new(LoggingAlertSink),
            metrics,
            Arc::new(InMemoryAuditLog::new()),
        )
        .with_default_detectors(Arc::new(InMemoryProfileStore::new())),
    )
}

/// Full application state with traffic observation off.
pub fn test_state(harness: &Harness) -> AppState {
    AppState {
        service: harness.service.clone(),
        monitor: test_monitor(harness.metrics.clone()),
        monitor_handle: None,
        zones: Arc::new(ZoneCatalog::fixed(default_zones())),
        metrics: harness.metrics.clone(),
        health: harness.store.clone(),
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Offset a point by metres north and east.
pub fn offset(origin: &GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    const METERS_PER_DEGREE: f64 = 111_319.9;
    GeoPoint::new(
        origin.lat + north_m / METERS_PER_DEGREE,
        origin.lon + east_m / (METERS_PER_DEGREE * origin.lat.to_radians().cos()),
    )
}

/// Session started two hours ago.
pub fn session_start() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(2)
}

/// One photo per hash, 10 m apart, two minutes apart, in Kenscoff.
pub fn photos(hashes: &[&str]) -> Vec<Photo> {
    let start = session_start();
    hashes
        .iter()
        .enumerate()
        .map(|(i, hash)| Photo {
            content_hash: hash.to_string(),
            location: offset(&KENSCOFF, 10.0 * i as f64, 0.0),
            captured_at: start + chrono::Duration::minutes(2 * i as i64),
            device_metadata: None,
        })
        .collect()
}

/// A well-formed submission claiming one tree per photo.
pub fn submission(planter: &str, hashes: &[&str]) -> EvidenceSubmission {
    EvidenceSubmission {
        evidence_id: None,
        planter_id: planter.to_string(),
        session_id: format!("session-{}", uuid::Uuid::new_v4()),
        total_trees_claimed: hashes.len() as u32,
        species: vec!["pine".to_string()],
        photos: photos(hashes),
        submitted_at: None,
    }
}

/// Unique photo hashes for one test.
pub fn unique_hashes(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-{i}")).collect()
}
