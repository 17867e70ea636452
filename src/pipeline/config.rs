//! Pipeline configuration
//!
//! # Environment
//!
//! - `VERIFICATION_THRESHOLD` - Minimum weighted score to verify (default: 0.75)
//! - `WEIGHT_GEOSPATIAL`, `WEIGHT_SATELLITE`, `WEIGHT_PHOTO`, `WEIGHT_DUPLICATE`,
//!   `WEIGHT_WEATHER`, `WEIGHT_TEMPORAL`, `WEIGHT_COMMUNITY` - Checker weights
//! - `SOFT_CHECK_TIMEOUT_MS` - Per-checker deadline for soft checkers (default: 10000)
//! - `HARD_CHECK_TIMEOUT_MS` - Per-checker deadline for hard blockers (default: 30000)
//! - `SUBMISSION_TIMEOUT_MS` - Deadline for the whole fan-out (default: 60000)
//! - `MIN_PARTICIPATING_WEIGHT` - Hold pending below this participating weight (default: 0.0)
//! - `RECHECK_INTERVAL_SECS` - Pending re-check period (default: 300)
//! - `RECHECK_BATCH_SIZE` - Evidence re-checked per run (default: 50)

use std::time::Duration;

use super::aggregator::CheckWeights;
use crate::domain::CheckerKind;
use crate::infra::{Result, RetryConfig, VerificationError};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Configuration for the verification pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub weights: CheckWeights,
    /// Score needed for a verified decision
    pub threshold: f64,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub submission_timeout: Duration,
    /// Participating weight below which no automated decision is made
    pub min_participating_weight: f64,
    pub recheck_interval: Duration,
    pub recheck_batch_size: u32,
    pub reward_retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights: CheckWeights::default(),
            threshold: 0.75,
            soft_timeout: Duration::from_secs(10),
            hard_timeout: Duration::from_secs(30),
            submission_timeout: Duration::from_secs(60),
            min_participating_weight: 0.0,
            recheck_interval: Duration::from_secs(300),
            recheck_batch_size: 50,
            reward_retry: RetryConfig::reward_delivery(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            weights: CheckWeights::from_env(),
            threshold: env_parse("VERIFICATION_THRESHOLD").unwrap_or(defaults.threshold),
            soft_timeout: env_parse("SOFT_CHECK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.soft_timeout),
            hard_timeout: env_parse("HARD_CHECK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.hard_timeout),
            submission_timeout: env_parse("SUBMISSION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.submission_timeout),
            min_participating_weight: env_parse("MIN_PARTICIPATING_WEIGHT")
                .unwrap_or(defaults.min_participating_weight),
            recheck_interval: env_parse("RECHECK_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.recheck_interval),
            recheck_batch_size: env_parse("RECHECK_BATCH_SIZE")
                .unwrap_or(defaults.recheck_batch_size),
            reward_retry: defaults.reward_retry,
        }
    }

    /// Deadline for one checker: hard blockers get the longer one.
    pub fn timeout_for(&self, kind: CheckerKind) -> Duration {
        if kind.is_hard_blocker() {
            self.hard_timeout
        } else {
            self.soft_timeout
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(VerificationError::Configuration(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_participating_weight) {
            return Err(VerificationError::Configuration(format!(
                "min_participating_weight must be in [0, 1], got {}",
                self.min_participating_weight
            )));
        }
        self.weights.validate()?;
        if self.submission_timeout.is_zero() {
            return Err(VerificationError::Configuration(
                "submission timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeout_for(CheckerKind::Duplicate), Duration::from_secs(30));
        assert_eq!(config.timeout_for(CheckerKind::Weather), Duration::from_secs(10));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = PipelineConfig {
            threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VerificationError::Configuration(_))
        ));
    }
}
