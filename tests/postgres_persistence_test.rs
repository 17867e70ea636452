//! Postgres store tests.
//!
//! Tests the persistence layer directly:
//! - PgStore: evidence rows and the append-only verification log
//! - PgHashIndex: atomic fingerprint claims
//! - PgSecurityEventStore: severity filter and resolution
//!
//! Run with: `cargo test -- --ignored`

mod common;

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use planting_verifier::domain::{
    DecisionStatus, PerceptualHash, PlanterId, SecurityEvent, SecurityEventType, Severity,
    VerificationLog,
};
use planting_verifier::infra::{
    EvidenceStore, HashEntry, HashIndex, PgHashIndex, PgSecurityEventStore, PgStore,
    SecurityEventStore, VerificationError, VerificationLogStore,
};
use planting_verifier::pipeline::{Aggregator, CheckWeights, IntakeLimits};

use common::*;

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .ok()?;
    planting_verifier::migrations::run_postgres(&pool)
        .await
        .unwrap();
    Some(pool)
}

fn decided_log(evidence: &planting_verifier::PlantingEvidence) -> VerificationLog {
    Aggregator::new(CheckWeights::default(), 0.75)
        .decide(&[])
        .into_log(evidence.id, Vec::new(), None)
}

fn random_hash() -> PerceptualHash {
    PerceptualHash(Uuid::new_v4().as_u128() as u64)
}

#[tokio::test]
#[ignore]
async fn test_evidence_round_trip_and_duplicate_insert() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let store = PgStore::new(pool);

    let evidence = submission("pg-planter", &["pg-a", "pg-b"])
        .into_evidence(&IntakeLimits::default())
        .unwrap();
    store.insert(&evidence).await.unwrap();

    let loaded = store.get(evidence.id).await.unwrap().unwrap();
    assert_eq!(loaded.planter_id, evidence.planter_id);
    assert_eq!(loaded.photos.len(), 2);
    assert_eq!(loaded.species, evidence.species);

    let err = store.insert(&evidence).await.unwrap_err();
    assert!(matches!(err, VerificationError::DuplicateEvidence(id) if id == evidence.id));
}

#[tokio::test]
#[ignore]
async fn test_log_is_append_only_with_one_initial_row() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let store = PgStore::new(pool);

    let evidence = submission("pg-log", &["pg-log-a"])
        .into_evidence(&IntakeLimits::default())
        .unwrap();
    store.insert(&evidence).await.unwrap();

    // No participating checks: held pending.
    let first = decided_log(&evidence);
    assert_eq!(first.status, DecisionStatus::Pending);
    store.append(&first).await.unwrap();

    let competing = decided_log(&evidence);
    let err = store.append(&competing).await.unwrap_err();
    assert!(matches!(err, VerificationError::InitialLogExists(_)));

    let mut recheck = decided_log(&evidence);
    recheck.supersedes = Some(first.id);
    store.append(&recheck).await.unwrap();

    let history = store.history(evidence.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(store.latest(evidence.id).await.unwrap().unwrap().id, recheck.id);

    let pending = store.list_pending(500, 0).await.unwrap();
    assert!(pending
        .iter()
        .any(|p| p.evidence_id == evidence.id && p.last_status == Some(DecisionStatus::Pending)));
}

#[tokio::test]
#[ignore]
async fn test_fingerprint_claims_are_all_or_nothing() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let index = PgHashIndex::new(pool);
    let (owned, fresh) = (random_hash(), random_hash());
    let entry = |hash: PerceptualHash, evidence_id, planter: &str| HashEntry {
        hash,
        evidence_id,
        planter_id: PlanterId::new(planter),
        recorded_at: Utc::now(),
    };

    let owner_id = planting_verifier::EvidenceId::new();
    assert!(index
        .claim_all(&[entry(owned, owner_id, "pg-owner")])
        .await
        .unwrap()
        .is_empty());
    assert!(index
        .claim_all(&[entry(owned, planting_verifier::EvidenceId::new(), "pg-owner")])
        .await
        .unwrap()
        .is_empty());

    let thief_id = planting_verifier::EvidenceId::new();
    let conflicts = index
        .claim_all(&[
            entry(fresh, thief_id, "pg-thief"),
            entry(owned, thief_id, "pg-thief"),
        ])
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].evidence_id, owner_id);

    // The rejected batch rolled back its fresh fingerprint.
    assert!(index
        .find_matches(&[fresh], &PlanterId::new("pg-other"), 0)
        .await
        .unwrap()
        .is_empty());

    let matches = index
        .find_matches(&[owned], &PlanterId::new("pg-thief"), 0)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert!(index
        .find_matches(&[owned], &PlanterId::new("pg-owner"), 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore]
async fn test_security_events_filter_and_resolve() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let store = PgSecurityEventStore::new(pool);
    let source = format!("pg-{}", Uuid::new_v4());

    let high = SecurityEvent::new(
        SecurityEventType::UnauthorizedAccess,
        Severity::High,
        source.clone(),
        "forbidden admin call",
    );
    let low = SecurityEvent::new(
        SecurityEventType::LoginAttempt,
        Severity::Low,
        source.clone(),
        "login",
    );
    store.append(&high).await.unwrap();
    store.append(&low).await.unwrap();

    let since = Utc::now() - Duration::minutes(5);
    let highs = store.since(since, Some(Severity::High), 1000).await.unwrap();
    assert!(highs.iter().any(|e| e.id == high.id));
    assert!(highs.iter().all(|e| e.severity == Severity::High));

    assert!(store.resolve(high.id).await.unwrap());
    assert!(!store.resolve(Uuid::new_v4()).await.unwrap());
    let resolved = store.since(since, Some(Severity::High), 1000).await.unwrap();
    assert!(resolved.iter().find(|e| e.id == high.id).unwrap().resolved);
}
