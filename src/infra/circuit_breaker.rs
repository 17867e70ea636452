//! Circuit breaker for collaborator calls
//!
//! One breaker per external service (imagery, inference, weather, elevation,
//! storage, reward, alerting). When a service keeps failing, its checker
//! fails fast with an "unavailable" result instead of burning the per-checker
//! timeout on every submission.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Service unavailable, requests fail fast
//! - **HalfOpen**: Testing if service recovered

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use super::{Result, VerificationError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` before opening
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close
    pub success_threshold: u32,
    /// Initial open duration before probing again
    pub open_timeout: Duration,
    /// Window for counting failures
    pub failure_window: Duration,
    /// Concurrent trial requests allowed while half-open
    pub half_open_max_requests: u32,
    /// Open duration multiplier for consecutive opens
    pub backoff_multiplier: f64,
    /// Cap on the open duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0-1.0) applied to the open duration
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            half_open_max_requests: 2,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    /// Calls rejected due to open circuit
    pub rejected: AtomicU64,
    pub times_opened: AtomicU64,
    pub total_duration_ms: AtomicU64,
    pub calls_with_duration: AtomicU64,
}

impl CircuitBreakerStats {
    pub fn to_json(&self) -> serde_json::Value {
        let calls = self.calls_with_duration.load(Ordering::Relaxed);
        let avg_duration_ms = if calls > 0 {
            self.total_duration_ms.load(Ordering::Relaxed) / calls
        } else {
            0
        };

        serde_json::json!({
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "timeouts": self.timeouts.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "times_opened": self.times_opened.load(Ordering::Relaxed),
            "avg_duration_ms": avg_duration_ms,
        })
    }

    fn record_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.calls_with_duration.fetch_add(1, Ordering::Relaxed);
    }
}

struct InternalState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_started: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_requests: u32,
    consecutive_opens: u32,
    current_backoff: Duration,
}

impl InternalState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_started: None,
            opened_at: None,
            half_open_requests: 0,
            consecutive_opens: 0,
            current_backoff: config.open_timeout,
        }
    }
}

/// Circuit breaker guarding one collaborator
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let state = RwLock::new(InternalState::new(&config));
        Self {
            name: name.into(),
            config,
            state,
            stats: CircuitBreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);
        state.state
    }

    pub fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }

    /// Check if the circuit allows a request, reserving a half-open trial slot
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            CircuitState::HalfOpen => {
                if state.half_open_requests < self.config.half_open_max_requests {
                    state.half_open_requests += 1;
                    true
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.stats.successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.window_started = None;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                let now = Instant::now();
                match state.window_started {
                    Some(started) if now.duration_since(started) <= self.config.failure_window => {}
                    _ => {
                        state.window_started = Some(now);
                        state.failure_count = 0;
                    }
                }
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut state),
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker with a deadline.
    ///
    /// An open circuit and a failed call both surface as
    /// [`VerificationError::Collaborator`]; an elapsed deadline as
    /// [`VerificationError::Timeout`].
    pub async fn guard<F, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.is_allowed().await {
            return Err(VerificationError::collaborator(
                &self.name,
                "circuit breaker is open",
            ));
        }

        let start = Instant::now();
        match tokio::time::timeout(timeout, f).await {
            Ok(Ok(value)) => {
                self.stats.record_duration(start.elapsed());
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.stats.record_duration(start.elapsed());
                self.record_failure().await;
                Err(e)
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.record_failure().await;
                Err(VerificationError::Timeout {
                    checker: self.name.clone(),
                })
            }
        }
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        self.transition_to_open(&mut state);
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = InternalState::new(&self.config);
    }

    pub async fn current_backoff(&self) -> Duration {
        self.state.read().await.current_backoff
    }

    fn maybe_transition(&self, state: &mut InternalState) {
        if state.state == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= state.current_backoff {
                    tracing::info!(circuit = %self.name, "Circuit breaker transitioning to half-open");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.half_open_requests = 0;
                }
            }
        }
    }

    fn transition_to_open(&self, state: &mut InternalState) {
        state.consecutive_opens += 1;

        let base = self.config.open_timeout.as_secs_f64();
        let multiplier = self
            .config
            .backoff_multiplier
            .powi(state.consecutive_opens.saturating_sub(1) as i32);
        let capped = (base * multiplier).min(self.config.max_backoff.as_secs_f64());
        let jitter = if self.config.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * self.config.jitter_factor)
        } else {
            0.0
        };
        let backoff = Duration::from_secs_f64(capped + jitter);

        tracing::warn!(
            circuit = %self.name,
            failures = state.failure_count,
            consecutive_opens = state.consecutive_opens,
            backoff_secs = ?backoff,
            "Circuit breaker opened"
        );

        state.state = CircuitState::Open;
        state.current_backoff = backoff;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        state.half_open_requests = 0;
        self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn transition_to_closed(&self, state: &mut InternalState) {
        tracing::info!(circuit = %self.name, "Circuit breaker closed");

        *state = InternalState::new(&self.config);
    }
}

// ============================================================================
// Circuit Breaker Registry
// ============================================================================

/// One breaker per collaborator, created on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Registry whose breakers all use `config`.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(name) {
                return cb.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_config(name, self.config.clone())))
            .clone()
    }

    /// State and counters of every breaker, keyed by collaborator name
    pub async fn status(&self) -> serde_json::Value {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut status = serde_json::Map::new();

        for cb in breakers {
            status.insert(
                cb.name().to_string(),
                serde_json::json!({
                    "state": cb.state().await.to_string(),
                    "stats": cb.stats().to_json(),
                }),
            );
        }

        serde_json::Value::Object(status)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
