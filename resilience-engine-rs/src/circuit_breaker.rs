//! # Circuit Breakers
//!
//! Keyed registry of per-endpoint circuit breakers. The engine only relies on
//! two operations: `execute`, which short-circuits while the breaker is open,
//! and `force_open`, used when a cascade is detected. A forced-open breaker
//! closes by itself once `forced_open_duration` has passed.
//!
//! Features include:
//! - Standard circuit states (Closed, Open, Half-Open) plus Forced-Open
//! - Error percentage thresholds over a sliding window
//! - State transition history with reasons
//! - Race-safe creation of breakers on first use

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::AppError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked until the reset timeout elapses
    Open,
    /// Testing recovery, limited requests allowed
    HalfOpen,
    /// Opened by an operator or cascade detection for a fixed duration
    ForcedOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
            CircuitState::ForcedOpen => 3.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::ForcedOpen => write!(f, "FORCED_OPEN"),
        }
    }
}

/// Failure of a call made through a breaker
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker {name} is open")]
    Open { name: String },

    #[error(transparent)]
    Operation(AppError),
}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name } => {
                AppError::service_unavailable(&name).context("circuitBreaker", "open")
            }
            CircuitBreakerError::Operation(error) => error,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Size of the sliding window for error tracking
    pub window_size: usize,
    /// Error threshold percentage to trip the circuit (0.0 to 1.0)
    pub error_threshold: f64,
    /// Minimum number of requests before error threshold applies
    pub minimum_request_threshold: usize,
    /// Time to keep circuit open before testing
    pub reset_timeout: Duration,
    /// Number of consecutive successes to close circuit from half-open
    pub half_open_success_threshold: usize,
    /// Maximum number of allowed requests in half-open state
    pub half_open_max_calls: usize,
    /// How long `force_open` keeps the circuit open before closing it again
    pub forced_open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            error_threshold: 0.5,
            minimum_request_threshold: 10,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 3,
            half_open_max_calls: 3,
            forced_open_duration: Duration::from_secs(30),
        }
    }
}

/// Result tracking for a sliding window
#[derive(Debug)]
struct ResultWindow {
    size: usize,
    results: VecDeque<bool>,
    failure_count: usize,
}

impl ResultWindow {
    fn new(size: usize) -> Self {
        Self {
            size,
            results: VecDeque::with_capacity(size),
            failure_count: 0,
        }
    }

    fn add_result(&mut self, success: bool) {
        if self.results.len() >= self.size {
            if let Some(false) = self.results.pop_front() {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
        }
        self.results.push_back(success);
        if !success {
            self.failure_count += 1;
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.failure_count as f64 / self.results.len() as f64
        }
    }

    fn total(&self) -> usize {
        self.results.len()
    }

    fn clear(&mut self) {
        self.results.clear();
        self.failure_count = 0;
    }
}

/// One recorded state change
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub at: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
}

/// Point-in-time health of a breaker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitHealth {
    pub name: String,
    pub state: CircuitState,
    pub error_rate: f64,
    pub request_count: usize,
    pub failure_count: usize,
    pub rejected_count: u64,
    pub forced_open_count: u64,
    pub last_reason: Option<String>,
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    last_state_change: Instant,
    forced_until: Option<Instant>,
    window: ResultWindow,
    consecutive_successes: usize,
    half_open_remaining: usize,
    rejected: u64,
    forced_open: u64,
    transitions: Vec<StateTransition>,
}

/// A single named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Mutex<CircuitStats>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: Option<CircuitBreakerConfig>) -> Self {
        let config = config.unwrap_or_default();
        Self {
            name: name.into(),
            stats: Mutex::new(CircuitStats {
                state: CircuitState::Closed,
                last_state_change: Instant::now(),
                forced_until: None,
                window: ResultWindow::new(config.window_size),
                consecutive_successes: 0,
                half_open_remaining: config.half_open_max_calls,
                rejected: 0,
                forced_open: 0,
                transitions: Vec::new(),
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks the stats, closing an expired forced-open circuit first
    fn stats(&self) -> MutexGuard<'_, CircuitStats> {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired = stats.state == CircuitState::ForcedOpen
            && stats.forced_until.is_some_and(|until| Instant::now() >= until);
        if expired {
            stats.window.clear();
            self.transition(&mut stats, CircuitState::Closed, "Forced-open duration elapsed");
        }
        stats
    }

    /// Executes an async operation with circuit breaker protection
    pub async fn execute<F, T>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        if !self.is_allowed() {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Checks whether a request may pass, moving OPEN to HALF_OPEN once the
    /// reset timeout elapsed
    pub fn is_allowed(&self) -> bool {
        let mut stats = self.stats();
        let state = stats.state;
        let allowed = match state {
            CircuitState::Closed => true,
            CircuitState::ForcedOpen => false,
            CircuitState::Open => {
                if stats.last_state_change.elapsed() >= self.config.reset_timeout {
                    self.transition(&mut stats, CircuitState::HalfOpen, "Reset timeout elapsed");
                    stats.half_open_remaining = self.config.half_open_max_calls.saturating_sub(1);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if stats.half_open_remaining > 0 {
                    stats.half_open_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            stats.rejected += 1;
            counter!("circuit_breaker_rejected_total", 1, "circuit" => self.name.clone());
            debug!(circuit = %self.name, state = %stats.state, "Circuit open, request rejected");
        }
        allowed
    }

    /// Records a successful call
    pub fn record_success(&self) {
        let mut stats = self.stats();
        stats.window.add_result(true);

        if stats.state == CircuitState::HalfOpen {
            stats.consecutive_successes += 1;
            if stats.consecutive_successes >= self.config.half_open_success_threshold {
                self.transition(&mut stats, CircuitState::Closed, "Service recovered");
                stats.window.clear();
            }
        }
    }

    /// Records a failed call, tripping the circuit when the threshold is met
    pub fn record_failure(&self) {
        let mut stats = self.stats();
        stats.window.add_result(false);

        let state = stats.state;
        match state {
            CircuitState::Closed => {
                let tripped = stats.window.total() >= self.config.minimum_request_threshold
                    && stats.window.failure_rate() >= self.config.error_threshold;
                if tripped {
                    let reason = format!(
                        "Failure rate {:.2}% exceeded threshold {:.2}%",
                        stats.window.failure_rate() * 100.0,
                        self.config.error_threshold * 100.0
                    );
                    self.transition(&mut stats, CircuitState::Open, &reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut stats, CircuitState::Open, "Failed in half-open state");
            }
            CircuitState::Open | CircuitState::ForcedOpen => {}
        }
    }

    /// Opens the circuit for the configured forced-open duration
    pub fn force_open(&self, reason: &str) {
        self.force_open_for(reason, self.config.forced_open_duration);
    }

    /// Opens the circuit for `duration`; forcing again restarts the clock
    pub fn force_open_for(&self, reason: &str, duration: Duration) {
        let mut stats = self.stats();
        stats.forced_open += 1;
        stats.forced_until = Some(Instant::now() + duration);
        self.transition(&mut stats, CircuitState::ForcedOpen, reason);
    }

    /// Closes a circuit regardless of its state
    pub fn force_close(&self, reason: &str) {
        let mut stats = self.stats();
        stats.window.clear();
        self.transition(&mut stats, CircuitState::Closed, reason);
    }

    /// Resets the circuit to its initial closed state
    pub fn reset(&self) {
        let mut stats = self.stats();
        stats.window.clear();
        stats.rejected = 0;
        stats.forced_open = 0;
        self.transition(&mut stats, CircuitState::Closed, "Manual reset");
        stats.transitions.clear();
    }

    pub fn state(&self) -> CircuitState {
        self.stats().state
    }

    /// Number of times the breaker was forced open since the last reset
    pub fn forced_open_count(&self) -> u64 {
        self.stats().forced_open
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.stats().transitions.clone()
    }

    pub fn health(&self) -> CircuitHealth {
        let stats = self.stats();
        CircuitHealth {
            name: self.name.clone(),
            state: stats.state,
            error_rate: stats.window.failure_rate(),
            request_count: stats.window.total(),
            failure_count: stats.window.failure_count,
            rejected_count: stats.rejected,
            forced_open_count: stats.forced_open,
            last_reason: stats.transitions.last().map(|t| t.reason.clone()),
        }
    }

    fn transition(&self, stats: &mut CircuitStats, to: CircuitState, reason: &str) {
        let from = stats.state;
        stats.state = to;
        stats.last_state_change = Instant::now();
        stats.consecutive_successes = 0;
        if to != CircuitState::ForcedOpen {
            stats.forced_until = None;
        }
        if to == CircuitState::Closed {
            stats.half_open_remaining = self.config.half_open_max_calls;
        }
        stats.transitions.push(StateTransition {
            at: Utc::now(),
            from,
            to,
            reason: reason.to_string(),
        });

        gauge!("circuit_breaker_state", to.gauge_value(), "circuit" => self.name.clone());

        match to {
            CircuitState::Open | CircuitState::ForcedOpen => warn!(
                circuit = %self.name,
                from = %from,
                to = %to,
                reason = %reason,
                "Circuit opened"
            ),
            _ => info!(
                circuit = %self.name,
                from = %from,
                to = %to,
                reason = %reason,
                "Circuit state changed"
            ),
        }
    }
}

/// Keyed singleton registry of breakers
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: Option<CircuitBreakerConfig>) -> Self {
        Self {
            breakers: DashMap::new(),
            config: config.unwrap_or_default(),
        }
    }

    /// Returns the breaker for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        // entry() holds the shard lock, so concurrent creators agree on one instance
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, Some(self.config.clone()))));
        Arc::clone(breaker.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all_status(&self) -> Vec<CircuitHealth> {
        let mut status: Vec<CircuitHealth> = self.breakers.iter().map(|b| b.value().health()).collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Forces every named breaker open, creating missing ones
    pub fn force_open(&self, names: &[&str], reason: &str) {
        for name in names {
            self.get_or_create(name).force_open(reason);
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }

    /// Drops every breaker
    pub fn clear(&self) {
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;
    use tokio_test::assert_err;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 10,
            error_threshold: 0.5,
            minimum_request_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            half_open_success_threshold: 2,
            half_open_max_calls: 2,
            forced_open_duration: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_basic() {
        let cb = CircuitBreaker::new("GET /api/products", Some(test_config()));
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(150)).await;

        assert!(cb.is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_execute() {
        let cb = CircuitBreaker::new("POST /api/orders", Some(test_config()));

        let result = cb.execute(async { Ok::<_, AppError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        for _ in 0..5 {
            let _ = cb
                .execute(async { Err::<i32, _>(AppError::new("connection refused")) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let err = assert_err!(cb.execute(async { Ok::<_, AppError>(42) }).await);
        assert!(matches!(err, CircuitBreakerError::Open { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_blocks_until_reset() {
        let cb = CircuitBreaker::new("GET /api/cart", Some(test_config()));
        cb.force_open("Cascade failure detected");

        assert_eq!(cb.state(), CircuitState::ForcedOpen);
        assert_eq!(cb.forced_open_count(), 1);

        // the reset timeout does not apply to a forced-open circuit
        sleep(Duration::from_millis(150)).await;
        assert!(!cb.is_allowed());

        let err: AppError = cb
            .execute(async { Ok::<_, AppError>(()) })
            .await
            .unwrap_err()
            .into();
        assert_eq!(err.status_code, 503);
        assert_eq!(err.name, "ServiceUnavailableError");

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_open_expires() {
        let cb = CircuitBreaker::new("GET /api/cart", Some(test_config()));
        cb.force_open("Cascade failure detected");

        sleep(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::ForcedOpen);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(
            cb.health().last_reason.as_deref(),
            Some("Forced-open duration elapsed")
        );

        let result = cb.execute(async { Ok::<_, AppError>("served") }).await;
        assert_eq!(result.unwrap(), "served");
        assert_eq!(cb.forced_open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forcing_again_restarts_the_clock() {
        let cb = CircuitBreaker::new("GET /api/cart", Some(test_config()));
        cb.force_open("first cascade");
        sleep(Duration::from_secs(20)).await;
        cb.force_open_for("second cascade", Duration::from_secs(20));

        sleep(Duration::from_secs(15)).await;
        assert!(!cb.is_allowed());

        sleep(Duration::from_secs(6)).await;
        assert!(cb.is_allowed());
        assert_eq!(cb.forced_open_count(), 2);
    }

    #[test]
    fn test_transitions_record_reasons() {
        let cb = CircuitBreaker::new("GET /api/users", None);
        cb.force_open("operator");
        cb.force_close("operator done");

        let transitions = cb.transitions();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, CircuitState::ForcedOpen);
        assert_eq!(transitions[0].reason, "operator");
        assert_eq!(transitions[1].from, CircuitState::ForcedOpen);
        assert_eq!(cb.health().last_reason.as_deref(), Some("operator done"));
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new(None);
        let a = registry.get_or_create("GET /api/products");
        let b = registry.get_or_create("GET /api/products");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("GET /api/orders").is_none());
        assert_eq!(registry.names(), vec!["GET /api/products".to_string()]);
    }

    #[test]
    fn test_registry_concurrent_creation() {
        let registry = Arc::new(CircuitBreakerRegistry::new(None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_or_create("GET /api/hot"))
            })
            .collect();

        let breakers: Vec<Arc<CircuitBreaker>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_registry_force_open_and_reset_all() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.force_open(&["a", "b"], "maintenance");

        assert!(registry.all_status().iter().all(|h| h.state == CircuitState::ForcedOpen));

        registry.reset_all();
        assert!(registry.all_status().iter().all(|h| h.state == CircuitState::Closed));
    }
}
