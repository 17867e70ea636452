//! Verification pipeline
//!
//! Intake validation, the concurrent checker fan-out, score aggregation,
//! manual adjudication and the pending re-check worker.

mod aggregator;
mod config;
mod intake;
mod service;
mod worker;

pub use aggregator::{recommendations, Aggregator, CheckWeights, Decision};
pub use config::PipelineConfig;
pub use intake::{EvidenceSubmission, IntakeLimits};
pub use service::{OverrideRequest, RecheckSummary, VerificationService, VerificationServiceBuilder};
pub use worker::{RecheckMessage, RecheckWorker};
