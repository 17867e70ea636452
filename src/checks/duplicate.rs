//! Duplicate photo and redundant location detection.
//!
//! Three sub-checks, all authoritative: photos repeated inside one
//! submission, photos already owned by another planter's verified
//! submission, and a verified planting by the same planter at the same spot
//! within the redundancy window. Lookup failures are returned as errors so
//! an unavailable index never denies a legitimate claim on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use image::imageops::FilterType;
use image::DynamicImage;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use super::{failure_details, Checker};
use crate::domain::{
    CheckResult, CheckerKind, EvidenceId, PerceptualHash, PlantingEvidence, VerifiedPlanting,
};
use crate::infra::cache::LruCache;
use crate::infra::{
    HashEntry, HashIndex, PhotoStorage, PlantingHistory, Result, VerificationError,
};

/// Image fingerprinting.
pub trait PerceptualHasher: Send + Sync {
    fn fingerprint(&self, image: &[u8]) -> PerceptualHash;
}

/// Exact-content fingerprint: the first 8 bytes of SHA-256.
///
/// Catches byte-identical reuse only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Fingerprint;

impl PerceptualHasher for Sha256Fingerprint {
    fn fingerprint(&self, image: &[u8]) -> PerceptualHash {
        let digest = Sha256::digest(image);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        PerceptualHash(u64::from_be_bytes(head))
    }
}

const DCT_INPUT: usize = 32;
const DCT_KEPT: usize = 8;

/// DCT perceptual hash.
///
/// The photo is decoded, shrunk to 32x32 grayscale and transformed; each of
/// the 64 lowest-frequency coefficients becomes one bit, set when it lies
/// above the median of the AC coefficients. Re-encoding, resizing, metadata
/// edits and brightness shifts move only a few bits. Bytes that do not
/// decode as an image fall back to [`Sha256Fingerprint`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DctPerceptualHasher;

impl DctPerceptualHasher {
    fn hash_image(image: &DynamicImage) -> PerceptualHash {
        let gray = image
            .resize_exact(DCT_INPUT as u32, DCT_INPUT as u32, FilterType::Triangle)
            .to_luma8();
        let pixels: Vec<f64> = gray.pixels().map(|p| f64::from(p.0[0])).collect();

        let basis: Vec<[f64; DCT_INPUT]> = (0..DCT_KEPT)
            .map(|k| {
                let mut row = [0.0; DCT_INPUT];
                for (n, value) in row.iter_mut().enumerate() {
                    *value = (std::f64::consts::PI * (2 * n + 1) as f64 * k as f64
                        / (2 * DCT_INPUT) as f64)
                        .cos();
                }
                row
            })
            .collect();

        // Separable 2-D DCT-II, rows first, low frequencies only.
        let mut rows = vec![[0.0f64; DCT_KEPT]; DCT_INPUT];
        for (y, out) in rows.iter_mut().enumerate() {
            let line = &pixels[y * DCT_INPUT..(y + 1) * DCT_INPUT];
            for (u, coefficient) in out.iter_mut().enumerate() {
                *coefficient = line.iter().zip(&basis[u]).map(|(p, c)| p * c).sum();
            }
        }
        let mut coefficients = [0.0f64; DCT_KEPT * DCT_KEPT];
        for v in 0..DCT_KEPT {
            for u in 0..DCT_KEPT {
                coefficients[v * DCT_KEPT + u] = rows
                    .iter()
                    .zip(&basis[v])
                    .map(|(row, c)| row[u] * c)
                    .sum();
            }
        }

        let mut ac: Vec<f64> = coefficients[1..].to_vec();
        ac.sort_by(f64::total_cmp);
        let median = ac[ac.len() / 2];

        let bits = coefficients
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > median)
            .fold(0u64, |acc, (i, _)| acc | (1u64 << (63 - i)));
        PerceptualHash(bits)
    }
}

impl PerceptualHasher for DctPerceptualHasher {
    fn fingerprint(&self, bytes: &[u8]) -> PerceptualHash {
        match image::load_from_memory(bytes) {
            Ok(decoded) => Self::hash_image(&decoded),
            Err(e) => {
                tracing::debug!(error = %e, len = bytes.len(), "Photo did not decode; hashing raw bytes");
                Sha256Fingerprint.fingerprint(bytes)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateConfig {
    /// Hashes within this Hamming distance count as the same image.
    pub max_hamming_distance: u32,
    pub redundancy_radius_m: f64,
    pub redundancy_window_days: i64,
    pub fingerprint_cache_entries: usize,
    pub fingerprint_cache_ttl: Duration,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            max_hamming_distance: 6,
            redundancy_radius_m: 50.0,
            redundancy_window_days: 30,
            fingerprint_cache_entries: 10_000,
            fingerprint_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Post-decision writes: claim fingerprints and record the planting.
#[async_trait]
pub trait DuplicateLedger: Send + Sync {
    /// Claim every photo fingerprint for `evidence` and record the planting.
    /// All or nothing: when another planter owns any fingerprint, nothing is
    /// written and the conflicting owners are returned.
    async fn commit(&self, evidence: &PlantingEvidence, trees: u32) -> Result<Vec<HashEntry>>;

    /// Record an administrator-verified planting. Fingerprints are claimed
    /// all or nothing as in [`commit`](Self::commit), but the planting is
    /// recorded even when some of them belong to another planter.
    async fn commit_override(
        &self,
        evidence: &PlantingEvidence,
        trees: u32,
    ) -> Result<Vec<HashEntry>>;
}

pub struct DuplicateDetector {
    config: DuplicateConfig,
    storage: Arc<dyn PhotoStorage>,
    hasher: Arc<dyn PerceptualHasher>,
    index: Arc<dyn HashIndex>,
    history: Arc<dyn PlantingHistory>,
    cache: Arc<LruCache<String, PerceptualHash>>,
}

impl DuplicateDetector {
    pub fn new(
        config: DuplicateConfig,
        storage: Arc<dyn PhotoStorage>,
        hasher: Arc<dyn PerceptualHasher>,
        index: Arc<dyn HashIndex>,
        history: Arc<dyn PlantingHistory>,
    ) -> Self {
        let cache = Arc::new(LruCache::new(
            config.fingerprint_cache_entries,
            config.fingerprint_cache_ttl,
        ));
        Self {
            config,
            storage,
            hasher,
            index,
            history,
            cache,
        }
    }

    /// Fingerprints in photo order.
    async fn fingerprints(&self, evidence: &PlantingEvidence) -> Result<Vec<PerceptualHash>> {
        let mut tasks = JoinSet::new();
        for (index, photo) in evidence.photos.iter().enumerate() {
            let key = photo.content_hash.clone();
            let storage = self.storage.clone();
            let hasher = self.hasher.clone();
            let cache = self.cache.clone();
            tasks.spawn(async move {
                let hash = cache
                    .get_or_try_insert_with(key.clone(), || async move {
                        let bytes = storage.get_bytes(&key).await?;
                        Ok::<_, VerificationError>(hasher.fingerprint(&bytes))
                    })
                    .await;
                (index, hash)
            });
        }

        let mut hashes = vec![PerceptualHash(0); evidence.photos.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, hash) = joined
                .map_err(|e| VerificationError::Internal(format!("fingerprint task failed: {e}")))?;
            hashes[index] = hash?;
        }
        Ok(hashes)
    }

    /// Index pairs whose fingerprints collide.
    fn collisions(&self, hashes: &[PerceptualHash]) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                if hashes[i].distance(&hashes[j]) <= self.config.max_hamming_distance {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    fn fail(code: &str, reason: &str, extra: serde_json::Value) -> CheckResult {
        CheckResult::fail(
            CheckerKind::Duplicate,
            1.0,
            failure_details(code, reason, extra),
        )
    }
}

#[async_trait]
impl Checker for DuplicateDetector {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Duplicate
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let hashes = self.fingerprints(evidence).await?;

        // 1. Intra-submission
        let collisions = self.collisions(&hashes);
        if !collisions.is_empty() {
            let mut repeats: Vec<usize> = collisions.iter().map(|(_, later)| *later).collect();
            repeats.sort_unstable();
            repeats.dedup();
            return Ok(Self::fail(
                "intra_submission_duplicate",
                "duplicate photos in submission",
                json!({
                    "total_photos": hashes.len(),
                    "unique_photos": hashes.len() - repeats.len(),
                    "colliding_pairs": collisions,
                }),
            ));
        }

        // 2. Cross-planter reuse
        let matches = self
            .index
            .find_matches(
                &hashes,
                &evidence.planter_id,
                self.config.max_hamming_distance,
            )
            .await?;
        if !matches.is_empty() {
            let owners: Vec<EvidenceId> = matches.iter().map(|m| m.existing.evidence_id).collect();
            tracing::warn!(
                evidence_id = %evidence.id,
                planter_id = %evidence.planter_id,
                matches = matches.len(),
                "Photo reuse across planters"
            );
            return Ok(Self::fail(
                "cross_planter_duplicate",
                "photos already used by another planter",
                json!({ "matches": matches.len(), "owners": owners }),
            ));
        }

        // 3. Location redundancy for the same planter
        let fingerprints: Vec<String> = hashes.iter().map(PerceptualHash::to_hex).collect();
        let Some(centroid) = evidence.centroid() else {
            return Ok(CheckResult::pass(
                CheckerKind::Duplicate,
                1.0,
                json!({ "fingerprints": fingerprints }),
            ));
        };
        let since =
            evidence.claimed_at() - chrono::Duration::days(self.config.redundancy_window_days);
        let nearby: Vec<VerifiedPlanting> = self
            .history
            .recent_nearby(
                &evidence.planter_id,
                centroid,
                self.config.redundancy_radius_m,
                since,
            )
            .await?
            .into_iter()
            .filter(|p| p.evidence_id != evidence.id)
            .collect();
        if let Some(prior) = nearby.first() {
            return Ok(Self::fail(
                "recent_planting_same_location",
                "recent planting at same location",
                json!({
                    "prior_evidence_id": prior.evidence_id,
                    "prior_planted_at": prior.planted_at,
                    "radius_m": self.config.redundancy_radius_m,
                    "window_days": self.config.redundancy_window_days,
                }),
            ));
        }

        Ok(CheckResult::pass(
            CheckerKind::Duplicate,
            1.0,
            json!({ "fingerprints": fingerprints }),
        ))
    }
}

impl DuplicateDetector {
    async fn claim_fingerprints(&self, evidence: &PlantingEvidence) -> Result<Vec<HashEntry>> {
        let now = Utc::now();
        let entries: Vec<HashEntry> = self
            .fingerprints(evidence)
            .await?
            .into_iter()
            .map(|hash| HashEntry {
                hash,
                evidence_id: evidence.id,
                planter_id: evidence.planter_id.clone(),
                recorded_at: now,
            })
            .collect();

        let conflicts = self.index.claim_all(&entries).await?;
        if !conflicts.is_empty() {
            tracing::warn!(
                evidence_id = %evidence.id,
                conflicts = conflicts.len(),
                "Fingerprint claimed concurrently by another planter"
            );
        }
        Ok(conflicts)
    }

    async fn record_planting(&self, evidence: &PlantingEvidence, trees: u32) -> Result<()> {
        let Some(location) = evidence.centroid() else {
            return Ok(());
        };
        self.history
            .record(&VerifiedPlanting {
                evidence_id: evidence.id,
                planter_id: evidence.planter_id.clone(),
                location,
                trees,
                planted_at: evidence.claimed_at(),
                verified_at: Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl DuplicateLedger for DuplicateDetector {
    async fn commit(&self, evidence: &PlantingEvidence, trees: u32) -> Result<Vec<HashEntry>> {
        let conflicts = self.claim_fingerprints(evidence).await?;
        if conflicts.is_empty() {
            self.record_planting(evidence, trees).await?;
        }
        Ok(conflicts)
    }

    async fn commit_override(
        &self,
        evidence: &PlantingEvidence,
        trees: u32,
    ) -> Result<Vec<HashEntry>> {
        let conflicts = self.claim_fingerprints(evidence).await?;
        self.record_planting(evidence, trees).await?;
        Ok(conflicts)
    }
}
