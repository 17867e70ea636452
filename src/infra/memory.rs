//! In-memory implementations of the store traits
//!
//! Used by tests and by `STORAGE_BACKEND=memory`. Semantics match the
//! Postgres stores: logs are append-only with one initial row per evidence,
//! and hash claims are all-or-nothing per batch.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::{
    DecisionStatus, EvidenceId, GeoPoint, PendingVerification, PerceptualHash, PlanterId,
    PlantingEvidence, PlantingZone, SecurityEvent, Severity, VerificationLog, VerifiedPlanting,
};
use crate::geo::haversine_m;

use super::{
    ComponentHealth, EvidenceStore, HashEntry, HashIndex, HealthCheck,
    PlantingHistory, Result, SecurityEventStore, VerificationError, VerificationLogStore,
    ZoneStore,
};

// ============================================================================
// Evidence + verification logs
// ============================================================================

#[derive(Default)]
pub struct InMemoryStore {
    evidence: RwLock<HashMap<EvidenceId, PlantingEvidence>>,
    logs: RwLock<HashMap<EvidenceId, Vec<VerificationLog>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceStore for InMemoryStore {
    async fn insert(&self, evidence: &PlantingEvidence) -> Result<()> {
        let mut guard = self.evidence.write().await;
        if guard.contains_key(&evidence.id) {
            return Err(VerificationError::DuplicateEvidence(evidence.id));
        }
        guard.insert(evidence.id, evidence.clone());
        Ok(())
    }

    async fn get(&self, id: EvidenceId) -> Result<Option<PlantingEvidence>> {
        Ok(self.evidence.read().await.get(&id).cloned())
    }

    async fn list_pending(&self, limit: u32, offset: u32) -> Result<Vec<PendingVerification>> {
        let evidence = self.evidence.read().await;
        let logs = self.logs.read().await;

        let mut pending: Vec<PendingVerification> = evidence
            .values()
            .filter_map(|e| {
                let last_status = logs.get(&e.id).and_then(|rows| rows.last()).map(|l| l.status);
                match last_status {
                    Some(status) if status.is_final() => None,
                    _ => Some(PendingVerification {
                        evidence_id: e.id,
                        planter_id: e.planter_id.clone(),
                        total_trees_claimed: e.total_trees_claimed,
                        photo_count: e.photos.len() as u32,
                        submitted_at: e.submitted_at,
                        last_status,
                    }),
                }
            })
            .collect();
        pending.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.evidence_id.0.cmp(&b.evidence_id.0))
        });

        Ok(pending
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl VerificationLogStore for InMemoryStore {
    async fn append(&self, log: &VerificationLog) -> Result<()> {
        let mut logs = self.logs.write().await;
        let rows = logs.entry(log.evidence_id).or_default();
        if log.supersedes.is_none() && rows.iter().any(|r| r.supersedes.is_none()) {
            return Err(VerificationError::InitialLogExists(log.evidence_id));
        }
        rows.push(log.clone());
        Ok(())
    }

    async fn latest(&self, evidence_id: EvidenceId) -> Result<Option<VerificationLog>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&evidence_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn history(&self, evidence_id: EvidenceId) -> Result<Vec<VerificationLog>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&evidence_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl HealthCheck for InMemoryStore {
    async fn ping(&self) -> ComponentHealth {
        ComponentHealth::Healthy
    }
}

// ============================================================================
// Fingerprint index
// ============================================================================

/// Fingerprint index keyed by hash. Batch claims serialize on one writer
/// lock; lookups only take shard read locks.
#[derive(Default)]
pub struct InMemoryHashIndex {
    entries: DashMap<PerceptualHash, HashEntry>,
    claims: Mutex<()>,
}

impl InMemoryHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HashIndex for InMemoryHashIndex {
    async fn find_matches(
        &self,
        queries: &[PerceptualHash],
        exclude_planter: &PlanterId,
        max_distance: u32,
    ) -> Result<Vec<super::HashMatch>> {
        let mut matches = Vec::new();
        for query in queries {
            if max_distance == 0 {
                if let Some(entry) = self.entries.get(query) {
                    if &entry.planter_id != exclude_planter {
                        matches.push(super::HashMatch {
                            query: *query,
                            existing: entry.clone(),
                            distance: 0,
                        });
                    }
                }
                continue;
            }
            for entry in self.entries.iter() {
                let distance = query.distance(entry.key());
                if distance <= max_distance && &entry.planter_id != exclude_planter {
                    matches.push(super::HashMatch {
                        query: *query,
                        existing: entry.value().clone(),
                        distance,
                    });
                }
            }
        }
        Ok(matches)
    }

    async fn claim_all(&self, entries: &[HashEntry]) -> Result<Vec<HashEntry>> {
        let _writer = self.claims.lock().await;

        let conflicts: Vec<HashEntry> = entries
            .iter()
            .filter_map(|entry| {
                self.entries
                    .get(&entry.hash)
                    .filter(|existing| existing.planter_id != entry.planter_id)
                    .map(|existing| existing.value().clone())
            })
            .collect();
        if !conflicts.is_empty() {
            return Ok(conflicts);
        }

        for entry in entries {
            self.entries
                .entry(entry.hash)
                .or_insert_with(|| entry.clone());
        }
        Ok(conflicts)
    }
}

// ============================================================================
// Verified planting history
// ============================================================================

#[derive(Default)]
pub struct InMemoryPlantingHistory {
    by_planter: DashMap<PlanterId, Vec<VerifiedPlanting>>,
}

impl InMemoryPlantingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_planter.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PlantingHistory for InMemoryPlantingHistory {
    async fn recent_nearby(
        &self,
        planter_id: &PlanterId,
        location: GeoPoint,
        radius_m: f64,
        since: DateTime<Utc>,
    ) -> Result<Vec<VerifiedPlanting>> {
        Ok(self
            .by_planter
            .get(planter_id)
            .map(|rows| {
                rows.iter()
                    .filter(|p| p.planted_at >= since)
                    .filter(|p| haversine_m(&p.location, &location) <= radius_m)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record(&self, planting: &VerifiedPlanting) -> Result<()> {
        let mut rows = self
            .by_planter
            .entry(planting.planter_id.clone())
            .or_default();
        if !rows.iter().any(|p| p.evidence_id == planting.evidence_id) {
            rows.push(planting.clone());
        }
        Ok(())
    }
}

// ============================================================================
// Zones
// ============================================================================

#[derive(Default)]
pub struct InMemoryZoneStore {
    zones: RwLock<BTreeMap<String, PlantingZone>>,
}

impl InMemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ZoneStore for InMemoryZoneStore {
    async fn list(&self) -> Result<Vec<PlantingZone>> {
        Ok(self.zones.read().await.values().cloned().collect())
    }

    async fn upsert(&self, zone: &PlantingZone) -> Result<()> {
        self.zones
            .write()
            .await
            .insert(zone.id.clone(), zone.clone());
        Ok(())
    }
}

// ============================================================================
// Security events
// ============================================================================

#[derive(Default)]
pub struct InMemorySecurityEventStore {
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemorySecurityEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SecurityEventStore for InMemorySecurityEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        severity: Option<Severity>,
        limit: u32,
    ) -> Result<Vec<SecurityEvent>> {
        let events = self.events.read().await;
        let mut selected: Vec<SecurityEvent> = events
            .iter()
            .filter(|e| e.timestamp >= since)
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        selected.truncate(limit as usize);
        Ok(selected)
    }

    async fn resolve(&self, id: Uuid) -> Result<bool> {
        let mut events = self.events.write().await;
        Ok(match events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.resolved = true;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SecurityEventType;
    use chrono::Duration;
    use std::sync::Arc;

    fn log_for(evidence_id: EvidenceId, supersedes: Option<Uuid>, status: DecisionStatus) -> VerificationLog {
        VerificationLog {
            id: Uuid::new_v4(),
            evidence_id,
            results: vec![],
            weighted_score: 0.0,
            participating_weight: 0.0,
            verified: status == DecisionStatus::Verified,
            status,
            rejection: None,
            recommendations: vec![],
            manual_override: None,
            supersedes,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_initial_log_is_refused() {
        let store = InMemoryStore::new();
        let id = EvidenceId::new();
        let first = log_for(id, None, DecisionStatus::Pending);
        store.append(&first).await.unwrap();

        assert!(matches!(
            store.append(&log_for(id, None, DecisionStatus::Verified)).await,
            Err(VerificationError::InitialLogExists(_))
        ));
        store
            .append(&log_for(id, Some(first.id), DecisionStatus::Verified))
            .await
            .unwrap();

        assert_eq!(store.history(id).await.unwrap().len(), 2);
        assert_eq!(
            store.latest(id).await.unwrap().unwrap().status,
            DecisionStatus::Verified
        );
    }

    fn hash_entry(hash: u64, evidence_id: EvidenceId, planter: &str) -> HashEntry {
        HashEntry {
            hash: PerceptualHash(hash),
            evidence_id,
            planter_id: PlanterId::new(planter),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let index = Arc::new(InMemoryHashIndex::new());

        let mut handles = Vec::new();
        for n in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                let evidence_id = EvidenceId::new();
                let planter = format!("planter-{n}");
                index
                    .claim_all(&[
                        hash_entry(0xfeed, evidence_id, &planter),
                        hash_entry(0xbeef, evidence_id, &planter),
                    ])
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_empty() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_batch_claims_nothing() {
        let index = InMemoryHashIndex::new();
        let owner = EvidenceId::new();
        assert!(index
            .claim_all(&[hash_entry(0x01, owner, "planter-1")])
            .await
            .unwrap()
            .is_empty());

        let rejected = EvidenceId::new();
        let conflicts = index
            .claim_all(&[
                hash_entry(0x02, rejected, "planter-2"),
                hash_entry(0x01, rejected, "planter-2"),
            ])
            .await
            .unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].evidence_id, owner);
        assert_eq!(index.len(), 1);
        assert!(index
            .find_matches(&[PerceptualHash(0x02)], &PlanterId::new("planter-3"), 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reclaim_by_same_planter_keeps_first_owner() {
        let index = InMemoryHashIndex::new();
        let first = EvidenceId::new();
        index
            .claim_all(&[hash_entry(0x0a, first, "planter-1")])
            .await
            .unwrap();

        let conflicts = index
            .claim_all(&[
                hash_entry(0x0a, EvidenceId::new(), "planter-1"),
                hash_entry(0x0b, EvidenceId::new(), "planter-1"),
            ])
            .await
            .unwrap();

        assert!(conflicts.is_empty());
        assert_eq!(index.len(), 2);
        let held = index
            .find_matches(&[PerceptualHash(0x0a)], &PlanterId::new("planter-2"), 0)
            .await
            .unwrap();
        assert_eq!(held[0].existing.evidence_id, first);
    }

    #[tokio::test]
    async fn hamming_tolerance_matches_near_hashes() {
        let index = InMemoryHashIndex::new();
        index
            .claim_all(&[hash_entry(0b1111, EvidenceId::new(), "a")])
            .await
            .unwrap();

        let query = [PerceptualHash(0b1110)];
        let other = PlanterId::new("b");
        assert!(index.find_matches(&query, &other, 0).await.unwrap().is_empty());
        assert_eq!(index.find_matches(&query, &other, 1).await.unwrap().len(), 1);
        assert!(index
            .find_matches(&query, &PlanterId::new("a"), 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn pending_lists_unlogged_and_pending_only() {
        let store = InMemoryStore::new();
        let evidence = crate::checks::test_support::evidence_at(
            crate::checks::test_support::KENSCOFF,
            &[(0.0, 0.0)],
            1,
        );
        store.insert(&evidence).await.unwrap();
        assert_eq!(store.list_pending(10, 0).await.unwrap().len(), 1);

        store
            .append(&log_for(evidence.id, None, DecisionStatus::Rejected))
            .await
            .unwrap();
        assert!(store.list_pending(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn security_events_filter_and_resolve() {
        let store = InMemorySecurityEventStore::new();
        let now = Utc::now();
        let old = SecurityEvent::new(SecurityEventType::LoginFailure, Severity::Low, "10.0.0.1", "old")
            .at(now - Duration::hours(2));
        let fresh = SecurityEvent::new(
            SecurityEventType::BruteForceDetected,
            Severity::High,
            "10.0.0.1",
            "fresh",
        );
        store.append(&old).await.unwrap();
        store.append(&fresh).await.unwrap();

        let recent = store.since(now - Duration::hours(1), None, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        let low = store
            .since(now - Duration::hours(3), Some(Severity::Low), 10)
            .await
            .unwrap();
        assert_eq!(low[0].id, old.id);

        assert!(store.resolve(fresh.id).await.unwrap());
        assert!(!store.resolve(Uuid::new_v4()).await.unwrap());
    }
}
