//! # Recovery Orchestration
//!
//! Runs the category's ordered strategy list until one succeeds. Waiting
//! strategies are bounded per correlation key by attempt caps, and every
//! delay is a tokio timer, so a recovering request never blocks a worker.
//!
//! Strategy lists per category:
//! - `DATABASE`: exponential backoff, circuit breaker, graceful degradation
//! - `NETWORK`: retry with jitter, circuit breaker, fallback service
//! - `EXTERNAL_SERVICE`: circuit breaker, fallback service, graceful degradation
//! - anything else: no strategies

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry};
use crate::config::RecoveryConfig;
use crate::context::RequestContext;
use crate::correlation::generate_key;
use crate::types::{AppError, EngineError, ErrorCategory, Result};

const RETRY_ACTION: &str = "retry";
const FALLBACK_REQUIRED_ACTION: &str = "fallback-required";
const MAX_ATTEMPTS_REASON: &str = "Max recovery attempts reached";

/// A single remediation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Wait `base * 2^attempts` (capped), then retry
    ExponentialBackoff,
    /// Wait `base + uniform(0, range)`, then retry
    RetryWithJitter,
    /// Run the operation through the endpoint's breaker
    CircuitBreaker,
    /// Serve from a fallback source; always succeeds
    FallbackService,
    /// Serve reduced functionality; always succeeds
    GracefulDegradation,
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::ExponentialBackoff => "exponential-backoff",
            RecoveryStrategy::RetryWithJitter => "retry-with-jitter",
            RecoveryStrategy::CircuitBreaker => "circuit-breaker",
            RecoveryStrategy::FallbackService => "fallback-service",
            RecoveryStrategy::GracefulDegradation => "graceful-degradation",
        }
    }

    /// Ordered strategies tried for a category
    pub fn for_category(category: ErrorCategory) -> &'static [RecoveryStrategy] {
        use RecoveryStrategy::*;
        match category {
            ErrorCategory::Database => &[ExponentialBackoff, CircuitBreaker, GracefulDegradation],
            ErrorCategory::Network => &[RetryWithJitter, CircuitBreaker, FallbackService],
            ErrorCategory::ExternalService => &[CircuitBreaker, FallbackService, GracefulDegradation],
            _ => &[],
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a strategy or of a whole recovery chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Strategy that produced the outcome
    #[serde(skip)]
    pub strategy: Option<RecoveryStrategy>,
}

impl RecoveryOutcome {
    pub fn succeeded<S: Into<String>>(action: S, data: Value) -> Self {
        Self {
            success: true,
            action: Some(action.into()),
            reason: None,
            data: Some(data),
            strategy: None,
        }
    }

    pub fn failed<S: Into<String>>(reason: S) -> Self {
        Self {
            success: false,
            action: None,
            reason: Some(reason.into()),
            data: None,
            strategy: None,
        }
    }

    fn with_action<S: Into<String>>(mut self, action: S) -> Self {
        self.action = Some(action.into());
        self
    }

    fn tagged(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Human-readable summary for the response `recovery.message`
    pub fn message(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.reason.clone())
    }
}

/// Delay before the `attempt`-th backoff retry (zero based)
pub fn backoff_delay(config: &RecoveryConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let delay_ms = config.backoff_base_ms.saturating_mul(factor).min(config.backoff_max_ms);
    Duration::from_millis(delay_ms)
}

/// Base delay plus uniform jitter
pub fn jitter_delay(config: &RecoveryConfig) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=config.jitter_range_ms);
    Duration::from_millis(config.jitter_base_ms + jitter)
}

/// Per-key, per-strategy recovery driver
#[derive(Debug)]
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    attempts: DashMap<String, u32>,
}

impl RecoveryOrchestrator {
    pub fn new(config: RecoveryConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            config,
            breakers,
            attempts: DashMap::new(),
        }
    }

    /// Tries the category's strategies in order; the first success wins.
    ///
    /// Strategy failures are logged and never propagate.
    pub async fn attempt_recovery(
        &self,
        error: &AppError,
        category: ErrorCategory,
        ctx: &RequestContext,
    ) -> RecoveryOutcome {
        let strategies = RecoveryStrategy::for_category(category);
        if strategies.is_empty() {
            debug!(category = %category, "No recovery strategies for category");
            return RecoveryOutcome::failed(format!("No recovery strategy for {}", category));
        }

        let mut last_failure = None;
        for strategy in strategies {
            match self.execute_strategy(*strategy, error, ctx).await {
                Ok(outcome) if outcome.success => {
                    info!(
                        strategy = %strategy,
                        category = %category,
                        request_id = %ctx.request_id,
                        action = ?outcome.action,
                        "Recovery succeeded"
                    );
                    return outcome;
                }
                Ok(outcome) => {
                    debug!(strategy = %strategy, reason = ?outcome.reason, "Recovery strategy declined");
                    last_failure = Some(outcome);
                }
                Err(e) => {
                    warn!(
                        strategy = %strategy,
                        category = %category,
                        request_id = %ctx.request_id,
                        error = %e,
                        "Recovery strategy failed"
                    );
                }
            }
        }

        last_failure.unwrap_or_else(|| RecoveryOutcome::failed("All recovery strategies failed"))
    }

    /// Runs a single strategy for the failed request
    pub async fn execute_strategy(
        &self,
        strategy: RecoveryStrategy,
        error: &AppError,
        ctx: &RequestContext,
    ) -> Result<RecoveryOutcome> {
        let outcome = match strategy {
            RecoveryStrategy::ExponentialBackoff => {
                let key = generate_key(error, ctx);
                self.retry_after_delay(strategy, &key, ctx, self.config.backoff_max_attempts, |attempt| {
                    backoff_delay(&self.config, attempt)
                })
                .await?
            }
            RecoveryStrategy::RetryWithJitter => {
                let key = generate_key(error, ctx);
                self.retry_after_delay(strategy, &key, ctx, self.config.jitter_max_attempts, |_| {
                    jitter_delay(&self.config)
                })
                .await?
            }
            RecoveryStrategy::CircuitBreaker => self.through_breaker(error, ctx).await?,
            RecoveryStrategy::FallbackService => RecoveryOutcome::succeeded(
                strategy.name(),
                json!({
                    "message": "Serving response from fallback service",
                    "fallback": true,
                }),
            ),
            RecoveryStrategy::GracefulDegradation => RecoveryOutcome::succeeded(
                strategy.name(),
                json!({
                    "message": "Service running with reduced functionality",
                    "degraded": true,
                }),
            ),
        };

        Ok(outcome.tagged(strategy))
    }

    async fn retry_after_delay<D>(
        &self,
        strategy: RecoveryStrategy,
        key: &str,
        ctx: &RequestContext,
        max_attempts: u32,
        delay_for: D,
    ) -> Result<RecoveryOutcome>
    where
        D: Fn(u32) -> Duration,
    {
        let counter_key = counter_key(strategy, key);

        // the entry guard must be released before waiting
        let attempt = {
            let mut count = self.attempts.entry(counter_key.clone()).or_insert(0);
            if *count >= max_attempts {
                None
            } else {
                let attempt = *count;
                *count += 1;
                Some(attempt)
            }
        };

        let Some(attempt) = attempt else {
            debug!(strategy = %strategy, key = %key, max_attempts, "Recovery attempts exhausted");
            return Ok(RecoveryOutcome::failed(MAX_ATTEMPTS_REASON));
        };

        let delay = delay_for(attempt);
        debug!(
            strategy = %strategy,
            key = %key,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Waiting before retry"
        );
        sleep(delay).await;

        let Some(operation) = ctx.retry.as_ref() else {
            return Ok(RecoveryOutcome::succeeded(
                RETRY_ACTION,
                json!({
                    "message": format!("Retry advised after {}ms", delay.as_millis()),
                    "attempt": attempt + 1,
                    "delayMs": delay.as_millis() as u64,
                }),
            ));
        };

        match operation().await {
            Ok(data) => {
                self.attempts.remove(&counter_key);
                Ok(RecoveryOutcome::succeeded(RETRY_ACTION, data))
            }
            Err(e) => Err(EngineError::Strategy {
                strategy: strategy.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn through_breaker(&self, error: &AppError, ctx: &RequestContext) -> Result<RecoveryOutcome> {
        let breaker = self.breakers.get_or_create(&ctx.endpoint());

        let result = match ctx.retry.as_ref() {
            Some(operation) => breaker.execute(operation()).await,
            // nothing to re-run; the original failure still counts against the breaker
            None => {
                let replay = error.clone();
                breaker.execute(async move { Err::<Value, _>(replay) }).await
            }
        };

        match result {
            Ok(data) => Ok(RecoveryOutcome::succeeded(RecoveryStrategy::CircuitBreaker.name(), data)),
            Err(CircuitBreakerError::Open { .. }) => {
                Ok(RecoveryOutcome::failed("Circuit breaker open").with_action(FALLBACK_REQUIRED_ACTION))
            }
            Err(CircuitBreakerError::Operation(e)) => Err(EngineError::Strategy {
                strategy: RecoveryStrategy::CircuitBreaker.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Attempts recorded for a strategy and correlation key
    pub fn attempt_count(&self, strategy: RecoveryStrategy, key: &str) -> u32 {
        self.attempts
            .get(&counter_key(strategy, key))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Forgets every attempt counter
    pub fn reset(&self) {
        self.attempts.clear();
    }
}

fn counter_key(strategy: RecoveryStrategy, key: &str) -> String {
    format!("{}:{}", strategy.name(), key)
}
