//! Planting Verifier Library
//!
//! Decides whether a planter's claim ("I planted N trees of these species
//! here") is genuine. Independent signal checkers run concurrently over the
//! submitted evidence, a weighted aggregator turns their results into a
//! verified / rejected / pending decision, and every decision is kept as an
//! append-only log. A security monitor watches submission and request
//! traffic for anomalies alongside.
//!
//! ## Modules
//!
//! - [`domain`] - Plain data types (evidence, zones, check results, logs, security events)
//! - [`geo`] - Geodesy: distances, point-in-polygon, hull area, clustering
//! - [`checks`] - The verification signals and the zone catalog
//! - [`pipeline`] - Intake, aggregation, the verification service and re-check worker
//! - [`anomaly`] - Anomaly detectors and the security monitor
//! - [`infra`] - Stores, collaborator clients, resilience and audit
//! - [`api`] - REST routes
//! - [`metrics`] - In-process metrics registry
//! - [`telemetry`] - Logging and OpenTelemetry tracing

pub mod anomaly;
pub mod api;
pub mod checks;
pub mod domain;
pub mod geo;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod pipeline;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    CheckResult, CheckerKind, DecisionStatus, EvidenceId, GeoPoint, PlanterId, PlantingEvidence,
    PlantingZone, RejectionCode, SecurityEvent, Severity, ThreatLevel, VerificationLog,
};

pub use infra::{Result, VerificationError};
pub use pipeline::{EvidenceSubmission, VerificationService};
