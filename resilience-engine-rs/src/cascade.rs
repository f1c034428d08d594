//! # Cascade Detection
//!
//! A correlation key is in cascade when it is both hot right now (events in
//! the window) and has a history (lifetime count). The lifetime count never
//! decays, so a key that crossed the count threshold once is judged on its
//! window frequency alone from then on.

use std::sync::Arc;

use tracing::error;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::CascadeConfig;
use crate::correlation::CorrelationResult;
use crate::metrics::MetricsAggregator;

#[derive(Debug)]
pub struct CascadeDetector {
    config: CascadeConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
}

impl CascadeDetector {
    pub fn new(
        config: CascadeConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            config,
            breakers,
            metrics,
        }
    }

    /// Pure threshold check; recomputed for every event
    pub fn evaluate(&self, result: &CorrelationResult) -> bool {
        result.frequency > self.config.frequency_threshold
            && result.group.count > self.config.count_threshold
    }

    /// Evaluates and, on a cascade, forces the endpoint's breaker open and
    /// counts the cascade
    pub fn check(&self, result: &CorrelationResult, endpoint: &str) -> bool {
        if !self.evaluate(result) {
            return false;
        }

        let reason = format!(
            "Cascade failure detected for {} ({} errors in window, {} total)",
            result.key, result.frequency, result.group.count
        );
        self.breakers.get_or_create(endpoint).force_open(&reason);
        self.metrics.record_cascade_failure();

        error!(
            correlation_key = %result.key,
            endpoint = %endpoint,
            frequency = result.frequency,
            count = result.group.count,
            "Cascade failure detected, circuit forced open"
        );
        true
    }
}
