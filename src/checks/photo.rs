//! Photo content analysis: tree counts, species, quality and tamper tags.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;

use super::{failure_details, Checker};
use crate::domain::{CheckResult, CheckerKind, Photo, PlantingEvidence};
use crate::infra::{InferenceService, PhotoStorage, Result, VerificationError};

/// Tags that fail the whole submission.
const HARD_TAGS: [&str; 3] = ["fake_trees", "digital_manipulation", "duplicate_trees"];

const MISSING_EXIF: &str = "missing_exif";
const ANALYSIS_FAILED: &str = "analysis_failed";
const DIGITAL_MANIPULATION: &str = "digital_manipulation";

/// Software signatures left in metadata by image editors.
const EDITOR_MARKERS: [&[u8]; 5] = [
    b"Adobe Photoshop",
    b"GIMP",
    b"Snapseed",
    b"PicsArt",
    b"Lightroom",
];

#[derive(Debug, Clone)]
pub struct PhotoConfig {
    pub max_trees_per_photo: u32,
    pub min_count_ratio: f64,
    pub max_count_ratio: f64,
    pub min_average_quality: f64,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            max_trees_per_photo: 20,
            min_count_ratio: 0.7,
            max_count_ratio: 1.3,
            min_average_quality: 0.6,
        }
    }
}

/// What one photo contributed.
#[derive(Debug, Clone, Default, Serialize)]
struct PhotoFinding {
    content_hash: String,
    trees: u32,
    species: Vec<String>,
    quality: f64,
    health: f64,
    tags: BTreeSet<String>,
    #[serde(skip)]
    analyzed: bool,
}

impl PhotoFinding {
    fn failed(content_hash: String, error: impl std::fmt::Display) -> Self {
        tracing::warn!(content_hash = %content_hash, error = %error, "Photo analysis failed");
        Self {
            content_hash,
            tags: BTreeSet::from([ANALYSIS_FAILED.to_string()]),
            ..Default::default()
        }
    }
}

/// Header-level tamper heuristics that need no inference.
fn local_tags(photo: &Photo, bytes: &[u8]) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    let has_exif = photo
        .device_metadata
        .as_ref()
        .is_some_and(|m| m.has_exif)
        || contains(bytes, b"Exif\0\0");
    if !has_exif {
        tags.insert(MISSING_EXIF.to_string());
    }
    if EDITOR_MARKERS.iter().any(|marker| contains(bytes, marker)) {
        tags.insert(DIGITAL_MANIPULATION.to_string());
    }
    tags
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Claimed species matches a detected one when either name contains the
/// other, ignoring case.
fn species_matches(claimed: &str, detected: &BTreeSet<String>) -> bool {
    let claimed = claimed.to_lowercase();
    detected
        .iter()
        .any(|d| d.contains(claimed.as_str()) || claimed.contains(d.as_str()))
}

pub struct PhotoAnalyzer {
    config: PhotoConfig,
    storage: Arc<dyn PhotoStorage>,
    inference: Arc<dyn InferenceService>,
}

impl PhotoAnalyzer {
    pub fn new(
        config: PhotoConfig,
        storage: Arc<dyn PhotoStorage>,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        Self {
            config,
            storage,
            inference,
        }
    }

    async fn analyze_one(
        photo: Photo,
        cap: u32,
        storage: Arc<dyn PhotoStorage>,
        inference: Arc<dyn InferenceService>,
    ) -> PhotoFinding {
        let bytes = match storage.get_bytes(&photo.content_hash).await {
            Ok(bytes) => bytes,
            Err(e) => return PhotoFinding::failed(photo.content_hash, e),
        };
        let mut tags = local_tags(&photo, &bytes);

        let outcome = tokio::try_join!(
            inference.detect_trees(&bytes),
            inference.classify_species(&bytes),
            inference.assess_photo(&bytes),
        );
        let (trees, species, assessment) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                let mut finding = PhotoFinding::failed(photo.content_hash, e);
                finding.tags.extend(tags);
                return finding;
            }
        };

        tags.extend(assessment.anomalies.iter().map(|t| t.to_lowercase()));
        PhotoFinding {
            content_hash: photo.content_hash,
            trees: trees.min(cap),
            species: species.into_iter().map(|s| s.to_lowercase()).collect(),
            quality: assessment.quality.clamp(0.0, 1.0),
            health: assessment.health.clamp(0.0, 1.0),
            tags,
            analyzed: true,
        }
    }
}

#[async_trait]
impl Checker for PhotoAnalyzer {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Photo
    }

    async fn check(&self, evidence: &PlantingEvidence) -> Result<CheckResult> {
        let mut tasks = JoinSet::new();
        for (index, photo) in evidence.photos.iter().cloned().enumerate() {
            let storage = self.storage.clone();
            let inference = self.inference.clone();
            let cap = self.config.max_trees_per_photo;
            tasks.spawn(async move {
                (index, Self::analyze_one(photo, cap, storage, inference).await)
            });
        }

        let mut findings = Vec::with_capacity(evidence.photos.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(finding) => findings.push(finding),
                Err(e) => {
                    return Err(VerificationError::Internal(format!(
                        "photo analysis task failed: {e}"
                    )))
                }
            }
        }
        findings.sort_by_key(|(index, _)| *index);
        let findings: Vec<PhotoFinding> = findings.into_iter().map(|(_, f)| f).collect();

        let analyzed: Vec<&PhotoFinding> = findings.iter().filter(|f| f.analyzed).collect();
        if analyzed.is_empty() {
            return Err(VerificationError::collaborator(
                "inference",
                format!("all {} photos failed analysis", findings.len()),
            ));
        }

        // Tamper tags are authoritative, even on photos whose inference failed.
        let tampered: Vec<serde_json::Value> = findings
            .iter()
            .filter_map(|f| {
                let hard: Vec<&String> = f
                    .tags
                    .iter()
                    .filter(|t| HARD_TAGS.contains(&t.as_str()))
                    .collect();
                (!hard.is_empty()).then(|| json!({ "content_hash": f.content_hash, "tags": hard }))
            })
            .collect();
        if !tampered.is_empty() {
            return Ok(CheckResult::fail(
                CheckerKind::Photo,
                0.95,
                failure_details(
                    "tampered_photo",
                    "photo flagged as fake or manipulated",
                    json!({ "tampered": tampered, "photos": findings }),
                ),
            )
            .with_hard_block());
        }

        // Extrapolate over photos that could not be analyzed.
        let detected: u32 = analyzed.iter().map(|f| f.trees).sum();
        let coverage = analyzed.len() as f64 / findings.len() as f64;
        let estimated = f64::from(detected) / coverage;
        let claimed = f64::from(evidence.total_trees_claimed);
        let count_ratio = if claimed > 0.0 { estimated / claimed } else { 0.0 };
        let count_ok =
            (self.config.min_count_ratio..=self.config.max_count_ratio).contains(&count_ratio);

        let detected_species: BTreeSet<String> =
            analyzed.iter().flat_map(|f| f.species.iter().cloned()).collect();
        let unmatched: Vec<&String> = evidence
            .species
            .iter()
            .filter(|s| !species_matches(s, &detected_species))
            .collect();
        let species_ok = unmatched.is_empty();

        let average_quality =
            analyzed.iter().map(|f| f.quality).sum::<f64>() / analyzed.len() as f64;
        let average_health =
            analyzed.iter().map(|f| f.health).sum::<f64>() / analyzed.len() as f64;
        let quality_ok = average_quality >= self.config.min_average_quality;

        let passed = count_ok && species_ok && quality_ok;
        let mut details = json!({
            "detected_trees": detected,
            "estimated_trees": estimated.round(),
            "claimed_trees": evidence.total_trees_claimed,
            "count_ratio": count_ratio,
            "detected_species": detected_species,
            "unmatched_species": unmatched,
            "average_quality": average_quality,
            "average_health": average_health,
            "analyzed_photos": analyzed.len(),
            "photos": findings,
        });
        let confidence = (average_quality * coverage).clamp(0.0, 1.0);

        if passed {
            return Ok(CheckResult::pass(CheckerKind::Photo, confidence, details));
        }

        let (code, reason) = if !count_ok {
            ("tree_count_mismatch", "detected tree count does not match claim")
        } else if !species_ok {
            ("species_mismatch", "claimed species not detected")
        } else {
            ("low_photo_quality", "photo quality below minimum")
        };
        details = failure_details(code, reason, details);
        Ok(CheckResult::fail(CheckerKind::Photo, confidence, details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::{evidence_at, KENSCOFF};
    use crate::domain::{DeviceMetadata, PhotoAssessment};
    use crate::infra::{MockInferenceService, MockPhotoStorage};

    fn storage_with(bytes: &'static [u8]) -> MockPhotoStorage {
        let mut storage = MockPhotoStorage::new();
        storage
            .expect_get_bytes()
            .returning(move |_| Ok(bytes.to_vec()));
        storage
    }

    fn inference(trees: u32, species: &'static str, quality: f64, tags: &'static [&'static str]) -> MockInferenceService {
        let mut mock = MockInferenceService::new();
        mock.expect_detect_trees().returning(move |_| Ok(trees));
        mock.expect_classify_species()
            .returning(move |_| Ok(vec![species.to_string()]));
        mock.expect_assess_photo().returning(move |_| {
            Ok(PhotoAssessment {
                health: 0.9,
                quality,
                anomalies: tags.iter().map(|t| t.to_string()).collect(),
            })
        });
        mock
    }

    fn with_exif(mut evidence: PlantingEvidence) -> PlantingEvidence {
        for photo in &mut evidence.photos {
            photo.device_metadata = Some(DeviceMetadata {
                has_exif: true,
                ..Default::default()
            });
        }
        evidence
    }

    fn two_photos(trees: u32) -> PlantingEvidence {
        with_exif(evidence_at(KENSCOFF, &[(0.0, 0.0), (5.0, 5.0)], trees))
    }

    #[tokio::test]
    async fn passes_when_counts_and_species_match() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(5, "Caribbean Pine", 0.8, &[])),
        );

        let result = analyzer.check(&two_photos(10)).await.unwrap();
        assert!(result.passed, "{}", result.details);
        assert_eq!(result.details["detected_trees"], 10);
    }

    #[tokio::test]
    async fn count_mismatch_is_soft() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(2, "pine", 0.8, &[])),
        );

        let result = analyzer.check(&two_photos(10)).await.unwrap();
        assert!(!result.passed);
        assert!(!result.is_blocking_failure());
        assert_eq!(result.reason_code(), Some("tree_count_mismatch"));
    }

    #[tokio::test]
    async fn per_photo_count_is_capped() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(500, "pine", 0.8, &[])),
        );

        let result = analyzer.check(&two_photos(40)).await.unwrap();
        assert_eq!(result.details["detected_trees"], 40);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn fake_tag_is_a_hard_block() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(5, "pine", 0.9, &["fake_trees"])),
        );

        let result = analyzer.check(&two_photos(10)).await.unwrap();
        assert!(result.is_blocking_failure());
        assert_eq!(result.reason_code(), Some("tampered_photo"));
    }

    #[tokio::test]
    async fn editor_marker_in_bytes_flags_manipulation() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"\xff\xd8Exif\0\0 Adobe Photoshop 2024")),
            Arc::new(inference(5, "pine", 0.9, &[])),
        );

        let result = analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0), (5.0, 5.0)], 10))
            .await
            .unwrap();
        assert!(result.hard_block);
    }

    #[tokio::test]
    async fn missing_exif_is_only_a_tag() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(5, "pine", 0.8, &[])),
        );

        let result = analyzer
            .check(&evidence_at(KENSCOFF, &[(0.0, 0.0), (5.0, 5.0)], 10))
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.details["photos"][0]["tags"][0], MISSING_EXIF);
    }

    #[tokio::test]
    async fn unmatched_species_fails_softly() {
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage_with(b"jpeg")),
            Arc::new(inference(5, "mahogany", 0.8, &[])),
        );

        let result = analyzer.check(&two_photos(10)).await.unwrap();
        assert_eq!(result.reason_code(), Some("species_mismatch"));
    }

    #[tokio::test]
    async fn every_photo_failing_is_not_a_verdict() {
        let mut storage = MockPhotoStorage::new();
        storage
            .expect_get_bytes()
            .returning(|_| Err(VerificationError::collaborator("storage", "gateway down")));
        let analyzer = PhotoAnalyzer::new(
            PhotoConfig::default(),
            Arc::new(storage),
            Arc::new(MockInferenceService::new()),
        );

        assert!(analyzer.check(&two_photos(10)).await.is_err());
    }

    #[test]
    fn fuzzy_species_match_works_both_ways() {
        let detected = BTreeSet::from(["caribbean pine".to_string()]);
        assert!(species_matches("pine", &detected));
        assert!(species_matches("Pine", &detected));
        assert!(!species_matches("cedar", &detected));

        let short = BTreeSet::from(["pine".to_string()]);
        assert!(species_matches("endemic_pine", &short));
    }
}
