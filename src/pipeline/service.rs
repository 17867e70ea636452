//! Verification service
//!
//! Orchestrates one submission through Received → Checking → Decided:
//!
//! 1. Fans the checkers out concurrently, each under its own deadline, all
//!    under one submission deadline
//! 2. Folds the results through the [`Aggregator`]
//! 3. Claims the photo fingerprints for a verified decision
//! 4. Appends the log row, audits it, and notifies rewards off the request
//!    path
//!
//! Each evidence id is verified by at most one task at a time; different
//! submissions never wait on each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::aggregator::{Aggregator, Decision};
use super::config::PipelineConfig;
use super::intake::{EvidenceSubmission, IntakeLimits};
use crate::anomaly::MonitorHandle;
use crate::checks::{Checker, CommunityAttestation, DuplicateLedger};
use crate::domain::{
    AdminId, CheckErrorKind, CheckResult, CheckerKind, DecisionStatus, EvidenceId,
    ManualOverride, OperationalEvent, PendingVerification, PlantingEvidence, RejectionCode,
    VerificationLog,
};
use crate::infra::{
    AuditAction, AuditLogBuilder, AuditSink, EvidenceStore, Result, Retry, RetryConfig,
    RewardIssuer, VerificationError, VerificationLogStore,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// An administrator's decision on a piece of evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub evidence_id: EvidenceId,
    pub verified: bool,
    pub reason: String,
    #[serde(default)]
    pub adjusted_trees: Option<u32>,
    pub admin_id: AdminId,
}

/// Outcome of one pending re-check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecheckSummary {
    pub checked: usize,
    pub verified: usize,
    pub rejected: usize,
    pub still_pending: usize,
    pub failed: usize,
}

pub struct VerificationService {
    config: PipelineConfig,
    aggregator: Aggregator,
    intake: IntakeLimits,
    checkers: BTreeMap<CheckerKind, Arc<dyn Checker>>,
    community: Option<Arc<CommunityAttestation>>,
    ledger: Arc<dyn DuplicateLedger>,
    evidence: Arc<dyn EvidenceStore>,
    logs: Arc<dyn VerificationLogStore>,
    rewards: Arc<dyn RewardIssuer>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsRegistry>,
    monitor: Option<MonitorHandle>,
    locks: DashMap<EvidenceId, Arc<Mutex<()>>>,
    /// In-flight reward notifications; finished handles are pruned on spawn.
    notifications: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl VerificationService {
    pub fn builder(config: PipelineConfig) -> VerificationServiceBuilder {
        VerificationServiceBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Validate and store a submission.
    #[instrument(skip(self, submission), fields(planter_id = %submission.planter_id))]
    pub async fn submit(&self, submission: EvidenceSubmission) -> Result<PlantingEvidence> {
        let evidence = submission.into_evidence(&self.intake)?;
        self.evidence.insert(&evidence).await?;

        self.metrics
            .inc_counter(metric_names::EVIDENCE_SUBMITTED)
            .await;
        self.record_audit(
            AuditLogBuilder::new(
                AuditAction::EvidenceSubmitted,
                evidence.planter_id.as_str(),
                "planter",
            )
            .resource("evidence", evidence.id.to_string())
            .details(json!({
                "trees_claimed": evidence.total_trees_claimed,
                "photos": evidence.photo_count(),
            })),
        )
        .await;

        info!(
            evidence_id = %evidence.id,
            trees = evidence.total_trees_claimed,
            photos = evidence.photo_count(),
            "Evidence submitted"
        );
        Ok(evidence)
    }

    pub async fn get_evidence(&self, id: EvidenceId) -> Result<PlantingEvidence> {
        self.evidence
            .get(id)
            .await?
            .ok_or(VerificationError::EvidenceNotFound(id))
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Verify evidence, or return its current decision.
    ///
    /// A decided or overridden log is returned as is. Evidence with no log,
    /// or whose newest row is pending, is checked again and a new row
    /// appended.
    #[instrument(skip(self), fields(evidence_id = %id))]
    pub async fn verify(&self, id: EvidenceId) -> Result<VerificationLog> {
        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            self.verify_locked(id).await
        };
        drop(lock);
        self.release_lock(id);
        outcome
    }

    async fn verify_locked(&self, id: EvidenceId) -> Result<VerificationLog> {
        let evidence = Arc::new(self.get_evidence(id).await?);
        let latest = self.logs.latest(id).await?;
        if let Some(log) = &latest {
            if log.status.is_final() || log.is_override() {
                debug!(status = %log.status, "Returning existing decision");
                return Ok(log.clone());
            }
        }

        let started = Instant::now();
        let results = self.run_checks(evidence.clone()).await;
        let decision = self.aggregator.decide(&results);
        let decision = self.settle(&evidence, decision).await;

        let log = decision.into_log(id, results, latest.as_ref().map(|l| l.id));
        match self.logs.append(&log).await {
            Ok(()) => {}
            Err(VerificationError::InitialLogExists(_)) => {
                // Another process decided first; its row is authoritative.
                warn!("Initial log written concurrently, returning it");
                return self
                    .logs
                    .latest(id)
                    .await?
                    .ok_or(VerificationError::LogNotFound(id));
            }
            Err(e) => return Err(e),
        }

        self.record_decision(&evidence, &log, started).await;
        if log.verified {
            self.notify_reward(&evidence, evidence.total_trees_claimed);
        }
        Ok(log)
    }

    /// Claim fingerprints for a verified decision. A fingerprint taken by
    /// another planter in the meantime turns it into a hard reject; a ledger
    /// failure holds it pending.
    async fn settle(&self, evidence: &PlantingEvidence, decision: Decision) -> Decision {
        if !decision.verified() {
            return decision;
        }
        match self
            .ledger
            .commit(evidence, evidence.total_trees_claimed)
            .await
        {
            Ok(conflicts) if conflicts.is_empty() => decision,
            Ok(conflicts) => {
                let owners: Vec<String> =
                    conflicts.iter().map(|c| c.evidence_id.to_string()).collect();
                warn!(owners = ?owners, "Fingerprints claimed by another submission");
                decision.reject(
                    RejectionCode::HardReject,
                    "duplicate: photo already used in another verified submission",
                )
            }
            Err(e) => {
                error!(error = %e, "Failed to record fingerprints");
                decision.hold("Verification pending: duplicate index unavailable")
            }
        }
    }

    /// Run every checker concurrently. Always returns one result per core
    /// checker, plus the community attestation when one exists.
    async fn run_checks(&self, evidence: Arc<PlantingEvidence>) -> Vec<CheckResult> {
        let deadline = tokio::time::Instant::now() + self.config.submission_timeout;
        let mut tasks: JoinSet<Option<CheckResult>> = JoinSet::new();

        for (kind, checker) in &self.checkers {
            let kind = *kind;
            let checker = checker.clone();
            let evidence = evidence.clone();
            let limit = self.config.timeout_for(kind);
            tasks.spawn(async move {
                let result = match tokio::time::timeout(limit, checker.check(&evidence)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(VerificationError::Timeout { checker })) => CheckResult::errored(
                        kind,
                        CheckErrorKind::Timeout,
                        format!("{checker} timed out"),
                    ),
                    Ok(Err(e)) => {
                        CheckResult::errored(kind, CheckErrorKind::Unavailable, e.to_string())
                    }
                    Err(_) => CheckResult::errored(
                        kind,
                        CheckErrorKind::Timeout,
                        format!("{kind} check exceeded {}ms", limit.as_millis()),
                    ),
                };
                Some(result)
            });
        }

        if let Some(community) = &self.community {
            let community = community.clone();
            let evidence = evidence.clone();
            let limit = self.config.timeout_for(CheckerKind::Community);
            tasks.spawn(async move {
                match tokio::time::timeout(limit, community.attest(&evidence)).await {
                    Ok(Ok(attestation)) => attestation,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Community attestation unavailable");
                        None
                    }
                    Err(_) => {
                        warn!("Community attestation timed out");
                        None
                    }
                }
            });
        }

        let mut collected: BTreeMap<CheckerKind, CheckResult> = BTreeMap::new();
        let mut cancelled = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(Some(result)))) => {
                    collected.insert(result.checker, result);
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Checker task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.submission_timeout.as_millis() as u64,
                        "Submission deadline reached, cancelling outstanding checks"
                    );
                    tasks.abort_all();
                    cancelled = true;
                    break;
                }
            }
        }

        for kind in CheckerKind::CORE {
            collected.entry(kind).or_insert_with(|| {
                if cancelled {
                    CheckResult::errored(
                        kind,
                        CheckErrorKind::Cancelled,
                        "cancelled by submission deadline",
                    )
                } else {
                    CheckResult::errored(kind, CheckErrorKind::Unavailable, "checker task failed")
                }
            });
        }

        for result in collected.values() {
            if let Some(err) = &result.error {
                let name = match err.kind {
                    CheckErrorKind::Unavailable => metric_names::checker_errors(result.checker.as_str()),
                    CheckErrorKind::Timeout | CheckErrorKind::Cancelled => {
                        metric_names::checker_timeouts(result.checker.as_str())
                    }
                };
                self.metrics.inc_counter(&name).await;
                warn!(checker = %result.checker, error = %err.message, "Checker degraded");
            }
        }

        collected.into_values().collect()
    }

    async fn record_decision(
        &self,
        evidence: &PlantingEvidence,
        log: &VerificationLog,
        started: Instant,
    ) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .inc_counter(metric_names::VERIFICATIONS_TOTAL)
            .await;
        let status_metric = match log.status {
            DecisionStatus::Verified => metric_names::VERIFICATIONS_VERIFIED,
            DecisionStatus::Rejected => metric_names::VERIFICATIONS_REJECTED,
            DecisionStatus::Pending => metric_names::VERIFICATIONS_PENDING,
        };
        self.metrics.inc_counter(status_metric).await;
        self.metrics
            .observe_histogram(metric_names::VERIFICATION_DURATION_MS, elapsed_ms)
            .await;

        self.record_audit(
            AuditLogBuilder::system(AuditAction::VerificationDecided)
                .resource("evidence", evidence.id.to_string())
                .details(json!({
                    "log_id": log.id,
                    "status": log.status,
                    "score": log.weighted_score,
                    "participating_weight": log.participating_weight,
                    "rejection": log.rejection,
                    "supersedes": log.supersedes,
                })),
        )
        .await;

        if let Some(monitor) = &self.monitor {
            let mut event = OperationalEvent::new("pipeline")
                .identity(evidence.planter_id.as_str())
                .action("submission")
                .resource("/evidence")
                .metric("trees_claimed", evidence.total_trees_claimed as f64)
                .metric("photo_count", evidence.photo_count() as f64)
                .at(evidence.claimed_at());
            if let Some(centroid) = evidence.centroid() {
                // Roughly 11 km cells.
                event = event.location(format!("{:.1},{:.1}", centroid.lat, centroid.lon));
            }
            monitor.observe(event);
        }

        info!(
            status = %log.status,
            score = log.weighted_score,
            participating_weight = log.participating_weight,
            elapsed_ms,
            "Verification decided"
        );
    }

    /// Notify reward issuance in the background with retries.
    fn notify_reward(&self, evidence: &PlantingEvidence, trees: u32) {
        let rewards = self.rewards.clone();
        let metrics = self.metrics.clone();
        let retry = Retry::new(self.config.reward_retry.clone());
        let evidence_id = evidence.id;
        let planter_id = evidence.planter_id.clone();

        let handle = tokio::spawn(async move {
            let outcome = retry
                .run("reward notification", || {
                    rewards.on_verified(evidence_id, &planter_id, trees)
                })
                .await;
            if let Err(e) = outcome.result {
                error!(
                    evidence_id = %evidence_id,
                    attempts = outcome.attempts,
                    error = %e,
                    "Reward notification failed"
                );
                metrics
                    .inc_counter(metric_names::REWARD_NOTIFICATION_FAILURES)
                    .await;
            }
        });

        let mut pending = self
            .notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every reward notification spawned so far, retries included.
    /// Short-lived callers (the admin CLI, tests) use this before exiting.
    pub async fn flush_notifications(&self) {
        let handles = std::mem::take(
            &mut *self
                .notifications
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Reward notification task failed");
            }
        }
    }

    // ========================================================================
    // Adjudication
    // ========================================================================

    /// Layer an administrator's decision over the latest log row.
    #[instrument(skip(self, request), fields(evidence_id = %request.evidence_id, admin_id = %request.admin_id))]
    pub async fn override_decision(&self, request: OverrideRequest) -> Result<VerificationLog> {
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(VerificationError::InvalidOverride(
                "a reason is required".to_string(),
            ));
        }
        if request.admin_id.as_str().trim().is_empty() {
            return Err(VerificationError::InvalidOverride(
                "admin_id is required".to_string(),
            ));
        }
        match (request.verified, request.adjusted_trees) {
            (false, Some(_)) => {
                return Err(VerificationError::InvalidOverride(
                    "adjusted_trees only applies to a verifying override".to_string(),
                ))
            }
            (true, Some(0)) => {
                return Err(VerificationError::InvalidOverride(
                    "adjusted_trees must be positive".to_string(),
                ))
            }
            _ => {}
        }

        let id = request.evidence_id;
        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            self.override_locked(&request, reason).await
        };
        drop(lock);
        self.release_lock(id);
        outcome
    }

    async fn override_locked(
        &self,
        request: &OverrideRequest,
        reason: &str,
    ) -> Result<VerificationLog> {
        let id = request.evidence_id;
        let evidence = self.get_evidence(id).await?;
        let prior = self
            .logs
            .latest(id)
            .await?
            .ok_or(VerificationError::LogNotFound(id))?;

        let row = VerificationLog::override_of(
            &prior,
            request.verified,
            ManualOverride {
                admin_id: request.admin_id.clone(),
                reason: reason.to_string(),
                adjusted_trees: request.adjusted_trees,
            },
        );
        self.logs.append(&row).await?;

        self.metrics.inc_counter(metric_names::OVERRIDES_TOTAL).await;
        self.record_audit(
            AuditLogBuilder::new(
                AuditAction::VerificationOverridden,
                request.admin_id.as_str(),
                "admin",
            )
            .resource("evidence", id.to_string())
            .details(json!({
                "log_id": row.id,
                "supersedes": prior.id,
                "previous_status": prior.status,
                "verified": request.verified,
                "reason": reason,
                "adjusted_trees": request.adjusted_trees,
            })),
        )
        .await;

        info!(
            previous = %prior.status,
            verified = request.verified,
            "Decision overridden"
        );

        if request.verified {
            let trees = request.adjusted_trees.unwrap_or(evidence.total_trees_claimed);
            if !prior.verified {
                match self.ledger.commit_override(&evidence, trees).await {
                    Ok(conflicts) if !conflicts.is_empty() => {
                        warn!(
                            conflicts = conflicts.len(),
                            "Override verifies evidence whose fingerprints are owned elsewhere; none claimed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to record fingerprints for override"),
                }
            }
            self.notify_reward(&evidence, trees);
        }
        Ok(row)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every log row for the evidence, oldest first.
    pub async fn history(&self, id: EvidenceId) -> Result<Vec<VerificationLog>> {
        let rows = self.logs.history(id).await?;
        if rows.is_empty() {
            // Distinguish "never verified" from "unknown evidence".
            self.get_evidence(id).await?;
        }
        Ok(rows)
    }

    pub async fn latest(&self, id: EvidenceId) -> Result<VerificationLog> {
        self.logs
            .latest(id)
            .await?
            .ok_or(VerificationError::LogNotFound(id))
    }

    pub async fn pending(&self, limit: u32, offset: u32) -> Result<Vec<PendingVerification>> {
        self.evidence.list_pending(limit.clamp(1, 500), offset).await
    }

    /// Re-run verification for up to `batch` pending submissions.
    #[instrument(skip(self))]
    pub async fn recheck_pending(&self, batch: u32) -> Result<RecheckSummary> {
        let listing = Retry::new(RetryConfig::default())
            .run_with_predicate(
                "list pending evidence",
                || self.evidence.list_pending(batch, 0),
                |e: &VerificationError| e.is_transient(),
            )
            .await;
        let pending = listing.result?;

        let mut summary = RecheckSummary::default();
        for item in pending {
            summary.checked += 1;
            match self.verify(item.evidence_id).await {
                Ok(log) => {
                    match log.status {
                        DecisionStatus::Verified => summary.verified += 1,
                        DecisionStatus::Rejected => summary.rejected += 1,
                        DecisionStatus::Pending => summary.still_pending += 1,
                    }
                    if item.last_status == Some(DecisionStatus::Pending) {
                        self.record_audit(
                            AuditLogBuilder::system(AuditAction::PendingRechecked)
                                .resource("evidence", item.evidence_id.to_string())
                                .details(json!({ "status": log.status, "log_id": log.id })),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(evidence_id = %item.evidence_id, error = %e, "Re-check failed");
                }
            }
        }

        if summary.checked > 0 {
            info!(
                checked = summary.checked,
                verified = summary.verified,
                rejected = summary.rejected,
                still_pending = summary.still_pending,
                failed = summary.failed,
                "Pending re-check complete"
            );
        }
        Ok(summary)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock_for(&self, id: EvidenceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-evidence lock once nobody else holds or waits on it.
    fn release_lock(&self, id: EvidenceId) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn record_audit(&self, entry: AuditLogBuilder) {
        if let Err(e) = self.audit.record(entry.build()).await {
            warn!(error = %e, "Failed to write audit entry");
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct VerificationServiceBuilder {
    config: PipelineConfig,
    intake: IntakeLimits,
    checkers: BTreeMap<CheckerKind, Arc<dyn Checker>>,
    community: Option<Arc<CommunityAttestation>>,
    ledger: Option<Arc<dyn DuplicateLedger>>,
    evidence: Option<Arc<dyn EvidenceStore>>,
    logs: Option<Arc<dyn VerificationLogStore>>,
    rewards: Option<Arc<dyn RewardIssuer>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<MetricsRegistry>>,
    monitor: Option<MonitorHandle>,
}

impl VerificationServiceBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            intake: IntakeLimits::default(),
            checkers: BTreeMap::new(),
            community: None,
            ledger: None,
            evidence: None,
            logs: None,
            rewards: None,
            audit: None,
            metrics: None,
            monitor: None,
        }
    }

    /// Register a checker; a later one of the same kind replaces it.
    pub fn checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checkers.insert(checker.kind(), checker);
        self
    }

    pub fn community(mut self, community: Arc<CommunityAttestation>) -> Self {
        self.community = Some(community);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn DuplicateLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn evidence_store(mut self, store: Arc<dyn EvidenceStore>) -> Self {
        self.evidence = Some(store);
        self
    }

    pub fn log_store(mut self, store: Arc<dyn VerificationLogStore>) -> Self {
        self.logs = Some(store);
        self
    }

    pub fn rewards(mut self, rewards: Arc<dyn RewardIssuer>) -> Self {
        self.rewards = Some(rewards);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn monitor(mut self, monitor: MonitorHandle) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn intake_limits(mut self, limits: IntakeLimits) -> Self {
        self.intake = limits;
        self
    }

    pub fn build(self) -> Result<VerificationService> {
        self.config.validate()?;

        let missing: Vec<&str> = CheckerKind::CORE
            .iter()
            .filter(|k| !self.checkers.contains_key(k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(VerificationError::Configuration(format!(
                "missing checkers: {}",
                missing.join(", ")
            )));
        }
        if self.checkers.contains_key(&CheckerKind::Community) {
            return Err(VerificationError::Configuration(
                "community attestation is registered with community(), not checker()".to_string(),
            ));
        }

        let required = |name: &str| {
            VerificationError::Configuration(format!("verification service needs {name}"))
        };
        let aggregator = Aggregator::new(self.config.weights, self.config.threshold)
            .with_min_participating_weight(self.config.min_participating_weight);

        Ok(VerificationService {
            aggregator,
            intake: self.intake,
            checkers: self.checkers,
            community: self.community,
            ledger: self.ledger.ok_or_else(|| required("a duplicate ledger"))?,
            evidence: self.evidence.ok_or_else(|| required("an evidence store"))?,
            logs: self.logs.ok_or_else(|| required("a log store"))?,
            rewards: self.rewards.ok_or_else(|| required("a reward issuer"))?,
            audit: self.audit.ok_or_else(|| required("an audit sink"))?,
            metrics: self.metrics.unwrap_or_default(),
            monitor: self.monitor,
            locks: DashMap::new(),
            notifications: std::sync::Mutex::new(Vec::new()),
            config: self.config,
        })
    }
}
