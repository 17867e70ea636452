//! End-to-end tests of the verification pipeline over in-memory stores.

mod common;

use std::sync::Arc;

use async_trait::async_trait;

use planting_verifier::checks::{
    Checker, TemporalChecker, TemporalConfig, VegetationAnalyzer, VegetationConfig,
    INSUFFICIENT_SATELLITE_DATA,
};
use planting_verifier::domain::{
    AdminId, CheckErrorKind, CheckerKind, DateRange, DecisionStatus, EvidenceId, GeoPoint,
    Imagery, RejectionCode, VegetationChange,
};
use planting_verifier::infra::{
    AuditAction, AuditQueryFilters, AuditSink, ImageryService, VerificationError,
};
use planting_verifier::pipeline::OverrideRequest;

use common::*;

fn override_request(
    evidence_id: EvidenceId,
    verified: bool,
    adjusted_trees: Option<u32>,
) -> OverrideRequest {
    OverrideRequest {
        evidence_id,
        verified,
        reason: "field inspection".to_string(),
        adjusted_trees,
        admin_id: AdminId::new("admin-1"),
    }
}

// ============================================================================
// Automated decisions
// ============================================================================

#[tokio::test]
async fn test_clean_submission_is_verified_and_rewarded() {
    let h = Harness::new();
    let evidence = h.submit("planter-clean", &["a1", "a2", "a3"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Verified);
    assert!(log.verified);
    assert!((log.weighted_score - 1.0).abs() < 1e-9);
    assert_eq!(log.results.len(), CheckerKind::CORE.len());
    assert!(log.rejection.is_none());

    h.service.flush_notifications().await;
    assert_eq!(
        h.rewards.issued(),
        vec![(evidence.id, "planter-clean".to_string(), 3)]
    );
    assert_eq!(h.index.len(), 3);
    assert_eq!(h.history.len(), 1);

    let decided = h
        .audit
        .query(AuditQueryFilters {
            action: Some(AuditAction::VerificationDecided),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(decided.len(), 1);
}

#[tokio::test]
async fn test_decided_evidence_is_not_checked_again() {
    let h = Harness::new();
    let evidence = h.submit("planter-idem", &["b1", "b2"]).await;

    let first = h.service.verify(evidence.id).await.unwrap();
    let second = h.service.verify(evidence.id).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.stub(CheckerKind::Geospatial).calls(), 1);
    assert_eq!(h.service.history(evidence.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_geospatial_failure_rejects_despite_high_score() {
    let h = Harness::new();
    h.stub(CheckerKind::Geospatial).set(Behavior::Fail("not in approved zone"));
    let evidence = h.submit("planter-outside", &["c1", "c2"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Rejected);
    let rejection = log.rejection.unwrap();
    assert_eq!(rejection.code, RejectionCode::HardReject);
    assert!(rejection.reason.contains("not in approved zone"));
    // Every other signal passed, the score alone would have verified.
    assert!(log.weighted_score > 0.75);

    h.service.flush_notifications().await;
    assert!(h.rewards.issued().is_empty());
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn test_overlapping_zone_failure_is_config_error() {
    let h = Harness::new();
    h.stub(CheckerKind::Geospatial)
        .set(Behavior::FailDataQuality("ambiguous/overlapping zone"));
    let evidence = h.submit("planter-overlap", &["d1"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Rejected);
    assert_eq!(log.rejection.unwrap().code, RejectionCode::ConfigError);
}

#[tokio::test]
async fn test_soft_failures_below_threshold_reject_with_low_score() {
    let h = Harness::new();
    h.stub(CheckerKind::Satellite).set(Behavior::Fail("no vegetation change"));
    h.stub(CheckerKind::Photo).set(Behavior::Fail("no trees detected"));
    let evidence = h.submit("planter-low", &["e1", "e2"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Rejected);
    assert_eq!(log.rejection.as_ref().unwrap().code, RejectionCode::LowScore);
    // (0.20 + 0.15 + 0.05 + 0.05) / 0.95
    assert!((log.weighted_score - 0.45 / 0.95).abs() < 1e-9);
    assert!(!log.recommendations.is_empty());
}

#[tokio::test]
async fn test_soft_timeout_is_left_out_of_the_score() {
    let h = Harness::new();
    h.stub(CheckerKind::Weather).set(Behavior::Hang);
    let evidence = h.submit("planter-slow-weather", &["f1", "f2"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Verified);
    assert!((log.participating_weight - 0.90).abs() < 1e-9);

    let weather = log.result(CheckerKind::Weather).unwrap();
    assert!(!weather.participates());
    assert_eq!(
        weather.error.as_ref().map(|e| e.kind),
        Some(CheckErrorKind::Timeout)
    );
}

#[tokio::test]
async fn test_unavailable_soft_checker_does_not_reject() {
    let h = Harness::new();
    h.stub(CheckerKind::Satellite).set(Behavior::Unavailable);
    h.stub(CheckerKind::Photo).set(Behavior::Unavailable);
    let evidence = h.submit("planter-outage", &["g1", "g2"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Verified);
    assert!((log.participating_weight - 0.45).abs() < 1e-9);
    assert_eq!(
        h.metrics.get_counter("checker_errors.satellite").await,
        1
    );
}

// ============================================================================
// Pending and re-check
// ============================================================================

#[tokio::test]
async fn test_geospatial_outage_holds_pending_until_recheck() {
    let h = Harness::new();
    h.stub(CheckerKind::Geospatial).set(Behavior::Unavailable);
    let evidence = h.submit("planter-pending", &["h1", "h2"]).await;

    let first = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(first.status, DecisionStatus::Pending);
    assert!(!first.verified);
    assert!(first.rejection.is_none());

    let pending = h.service.pending(10, 0).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].evidence_id, evidence.id);
    assert_eq!(pending[0].last_status, Some(DecisionStatus::Pending));

    h.stub(CheckerKind::Geospatial).set(Behavior::Pass);
    let summary = h.service.recheck_pending(10).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.verified, 1);

    let history = h.service.history(evidence.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].supersedes, Some(first.id));
    assert_eq!(history[1].status, DecisionStatus::Verified);
    assert!(h.service.pending(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hard_blocker_timeout_holds_pending() {
    let h = Harness::new();
    h.stub(CheckerKind::Geospatial).set(Behavior::Hang);
    let evidence = h.submit("planter-geo-timeout", &["i1"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Pending);
    assert!(log
        .recommendations
        .iter()
        .any(|r| r.contains("geospatial")));
}

#[tokio::test]
async fn test_submitted_but_unverified_evidence_is_listed_pending() {
    let h = Harness::new();
    let evidence = h.submit("planter-new", &["j1"]).await;

    let pending = h.service.pending(10, 0).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].evidence_id, evidence.id);
    assert_eq!(pending[0].last_status, None);
}

// ============================================================================
// Duplicates
// ============================================================================

#[tokio::test]
async fn test_photos_reused_by_another_planter_hard_reject() {
    let h = Harness::new();
    let original = h.submit("planter-owner", &["k1", "k2"]).await;
    assert!(h.service.verify(original.id).await.unwrap().verified);

    let copy = h.submit("planter-copier", &["k1", "k2"]).await;
    let log = h.service.verify(copy.id).await.unwrap();

    assert_eq!(log.status, DecisionStatus::Rejected);
    assert_eq!(log.rejection.as_ref().unwrap().code, RejectionCode::HardReject);
    let duplicate = log.result(CheckerKind::Duplicate).unwrap();
    assert_eq!(duplicate.reason_code(), Some("cross_planter_duplicate"));

    h.service.flush_notifications().await;
    assert_eq!(h.rewards.issued().len(), 1);
}

#[tokio::test]
async fn test_repeated_photo_in_one_submission_hard_rejects() {
    let h = Harness::new();
    let evidence = h.submit("planter-repeat", &["l1", "l2", "l1"]).await;

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Rejected);
    assert_eq!(
        log.result(CheckerKind::Duplicate).unwrap().reason_code(),
        Some("intra_submission_duplicate")
    );
}

#[tokio::test]
async fn test_concurrent_verifies_append_one_row() {
    let h = Harness::new();
    let evidence = h.submit("planter-race", &["m1", "m2"]).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let service = h.service.clone();
        let id = evidence.id;
        tasks.spawn(async move { service.verify(id).await });
    }

    let mut ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        ids.push(joined.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.service.history(evidence.id).await.unwrap().len(), 1);

    h.service.flush_notifications().await;
    assert_eq!(h.rewards.issued().len(), 1);
}

// ============================================================================
// Overrides
// ============================================================================

#[tokio::test]
async fn test_override_needs_a_prior_decision() {
    let h = Harness::new();
    let evidence = h.submit("planter-undecided", &["n1"]).await;

    let err = h
        .service
        .override_decision(override_request(evidence.id, true, None))
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::LogNotFound(id) if id == evidence.id));
}

#[tokio::test]
async fn test_override_supersedes_and_rewards_adjusted_trees() {
    let h = Harness::new();
    h.stub(CheckerKind::Satellite).set(Behavior::Fail("cloud cover"));
    h.stub(CheckerKind::Photo).set(Behavior::Fail("blurry"));
    let evidence = h.submit("planter-appeal", &["o1", "o2", "o3", "o4"]).await;

    let automated = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(automated.status, DecisionStatus::Rejected);

    let overridden = h
        .service
        .override_decision(override_request(evidence.id, true, Some(3)))
        .await
        .unwrap();
    assert_eq!(overridden.status, DecisionStatus::Verified);
    assert_eq!(overridden.supersedes, Some(automated.id));
    assert_eq!(overridden.results, automated.results);
    assert_eq!(
        overridden.manual_override.as_ref().unwrap().adjusted_trees,
        Some(3)
    );

    // The override is now the current decision.
    let current = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(current.id, overridden.id);

    h.service.flush_notifications().await;
    assert_eq!(
        h.rewards.issued(),
        vec![(evidence.id, "planter-appeal".to_string(), 3)]
    );
    assert_eq!(h.service.history(evidence.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejecting_override_records_manual_review() {
    let h = Harness::new();
    let evidence = h.submit("planter-revoked", &["p1"]).await;
    h.service.verify(evidence.id).await.unwrap();

    let log = h
        .service
        .override_decision(override_request(evidence.id, false, None))
        .await
        .unwrap();
    assert_eq!(log.status, DecisionStatus::Rejected);
    assert_eq!(log.rejection.unwrap().code, RejectionCode::ManualReview);
}

#[tokio::test]
async fn test_invalid_overrides_are_refused() {
    let h = Harness::new();
    let evidence = h.submit("planter-invalid-override", &["q1"]).await;
    h.service.verify(evidence.id).await.unwrap();

    let adjusted_on_reject = h
        .service
        .override_decision(override_request(evidence.id, false, Some(2)))
        .await;
    assert!(matches!(
        adjusted_on_reject,
        Err(VerificationError::InvalidOverride(_))
    ));

    let mut no_reason = override_request(evidence.id, true, None);
    no_reason.reason = "   ".to_string();
    assert!(matches!(
        h.service.override_decision(no_reason).await,
        Err(VerificationError::InvalidOverride(_))
    ));

    let zero_trees = h
        .service
        .override_decision(override_request(evidence.id, true, Some(0)))
        .await;
    assert!(matches!(zero_trees, Err(VerificationError::InvalidOverride(_))));
    assert_eq!(h.service.history(evidence.id).await.unwrap().len(), 1);
}

// ============================================================================
// Intake and lookups
// ============================================================================

#[tokio::test]
async fn test_submission_without_photos_is_malformed() {
    let h = Harness::new();
    let err = h
        .service
        .submit(submission("planter-empty", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::MalformedEvidence(_)));
}

#[tokio::test]
async fn test_resubmitting_an_evidence_id_conflicts() {
    let h = Harness::new();
    let id = EvidenceId::new();
    let mut first = submission("planter-dup-id", &["r1"]);
    first.evidence_id = Some(id);
    let second = first.clone();

    h.service.submit(first).await.unwrap();
    let err = h.service.submit(second).await.unwrap_err();
    assert!(matches!(err, VerificationError::DuplicateEvidence(dup) if dup == id));
}

#[tokio::test]
async fn test_unknown_evidence_is_not_found() {
    let h = Harness::new();
    let id = EvidenceId::new();

    assert!(matches!(
        h.service.verify(id).await,
        Err(VerificationError::EvidenceNotFound(_))
    ));
    assert!(matches!(
        h.service.history(id).await,
        Err(VerificationError::EvidenceNotFound(_))
    ));
}

// ============================================================================
// Field scenarios
// ============================================================================

/// Clear scenes in every window, but the provider has little faith in the
/// comparison.
struct LowConfidenceImagery;

#[async_trait]
impl ImageryService for LowConfidenceImagery {
    async fn search_imagery(
        &self,
        _location: GeoPoint,
        window: DateRange,
        _max_cloud_cover: f64,
    ) -> planting_verifier::Result<Vec<Imagery>> {
        let date = window.midpoint();
        Ok(vec![Imagery {
            id: format!("scene-{}", date.timestamp()),
            date,
            cloud_cover: 5.0,
            resolution_m: 10.0,
            url: "https://imagery.test/scene".to_string(),
        }])
    }

    async fn analyze_vegetation_change(
        &self,
        _location: GeoPoint,
        _before: &Imagery,
        _after: &Imagery,
    ) -> planting_verifier::Result<VegetationChange> {
        Ok(VegetationChange {
            index_delta: 0.02,
            increased_area_m2: 40.0,
            confidence: 0.3,
        })
    }
}

#[tokio::test]
async fn test_low_confidence_satellite_is_skipped_and_evidence_verifies() {
    let vegetation: Arc<dyn Checker> = Arc::new(VegetationAnalyzer::new(
        VegetationConfig::default(),
        Arc::new(LowConfidenceImagery),
    ));
    let h = Harness::with_checkers(test_config(), vec![vegetation]);
    let hashes = unique_hashes("field-sat", 10);
    let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();
    let evidence = h.submit("planter-field", &refs).await;
    assert_eq!(evidence.total_trees_claimed, 10);

    let log = h.service.verify(evidence.id).await.unwrap();
    assert_eq!(log.status, DecisionStatus::Verified);
    assert!(log.weighted_score >= 0.75);
    assert_eq!(
        log.details()["satellite"]["reason"],
        INSUFFICIENT_SATELLITE_DATA
    );
    assert_eq!(log.details()["satellite"]["low_confidence"], true);
}

#[tokio::test]
async fn test_implausible_travel_fails_temporal_without_rejecting() {
    let temporal: Arc<dyn Checker> = Arc::new(TemporalChecker::new(TemporalConfig::default()));
    let h = Harness::with_checkers(test_config(), vec![temporal]);

    let mut sprint = submission("planter-sprint", &["sp1", "sp2"]);
    sprint.photos[1].location = offset(&KENSCOFF, 200.0, 0.0);
    sprint.photos[1].captured_at = sprint.photos[0].captured_at + chrono::Duration::seconds(10);
    let evidence = h.service.submit(sprint).await.unwrap();

    let log = h.service.verify(evidence.id).await.unwrap();
    let temporal = log
        .results
        .iter()
        .find(|r| r.checker == CheckerKind::Temporal)
        .unwrap();
    assert!(!temporal.passed);
    assert!(temporal.error.is_none());

    // 0.90 of 0.95 participating weight still clears the threshold.
    assert_eq!(log.status, DecisionStatus::Verified);
    assert!((log.weighted_score - 0.90 / 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn test_override_keeps_the_automated_row_intact() {
    let h = Harness::new();
    h.stub(CheckerKind::Satellite).set(Behavior::Fail("no regrowth"));
    h.stub(CheckerKind::Photo).set(Behavior::Fail("trees not visible"));
    let evidence = h.submit("planter-audit", &["fc1", "fc2", "fc3"]).await;

    let automated = h.service.verify(evidence.id).await.unwrap();
    let mut request = override_request(evidence.id, true, Some(42));
    request.reason = "manual field check".to_string();
    h.service.override_decision(request).await.unwrap();

    let latest = h.service.latest(evidence.id).await.unwrap();
    assert_eq!(
        latest.manual_override.as_ref().unwrap().adjusted_trees,
        Some(42)
    );
    let history = h.service.history(evidence.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], automated);
}
