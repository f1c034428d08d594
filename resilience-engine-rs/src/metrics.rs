//! # Error Metrics
//!
//! In-process aggregation of handled errors, recovery outcomes and cascades.
//! Every counter is mirrored to the `metrics` facade so an installed recorder
//! (Prometheus or otherwise) sees the same numbers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::scheduler::PeriodicTask;
use crate::types::{ErrorCategory, Severity};

const MAX_FREQUENCY_TTL_DAYS: i64 = 365 * 100;

/// Rolling `category:endpoint` frequency entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyEntry {
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    total_errors: u64,
    errors_by_category: HashMap<ErrorCategory, u64>,
    errors_by_severity: HashMap<Severity, u64>,
    errors_by_endpoint: HashMap<String, u64>,
    recovery_attempts: u64,
    successful_recoveries: u64,
    cascade_failures: u64,
    error_frequency: HashMap<String, FrequencyEntry>,
}

impl MetricsState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            total_errors: 0,
            errors_by_category: HashMap::new(),
            errors_by_severity: HashMap::new(),
            errors_by_endpoint: HashMap::new(),
            recovery_attempts: 0,
            successful_recoveries: 0,
            cascade_failures: 0,
            error_frequency: HashMap::new(),
        }
    }
}

/// Point-in-time copy of the aggregated counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_errors: u64,
    pub errors_by_category: HashMap<ErrorCategory, u64>,
    pub errors_by_severity: HashMap<Severity, u64>,
    pub errors_by_endpoint: HashMap<String, u64>,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub cascade_failures: u64,
    pub error_frequency: HashMap<String, FrequencyEntry>,
    /// Two-decimal percentage, or `"0%"` before any recovery attempt
    pub recovery_rate: String,
    pub uptime_seconds: i64,
}

impl MetricsSnapshot {
    pub fn category_count(&self, category: ErrorCategory) -> u64 {
        self.errors_by_category.get(&category).copied().unwrap_or(0)
    }

    /// CRITICAL and FATAL errors together
    pub fn critical_errors(&self) -> u64 {
        [Severity::Critical, Severity::Fatal]
            .iter()
            .map(|s| self.errors_by_severity.get(s).copied().unwrap_or(0))
            .sum()
    }

    /// Share of all errors in `category`, 0.0 to 1.0
    pub fn category_share(&self, category: ErrorCategory) -> f64 {
        if self.total_errors == 0 {
            0.0
        } else {
            self.category_count(category) as f64 / self.total_errors as f64
        }
    }

    /// Numeric recovery rate in percent, `None` before any attempt
    pub fn recovery_rate_percent(&self) -> Option<f64> {
        recovery_rate(self.successful_recoveries, self.recovery_attempts)
    }

    /// Errors per elapsed second since the counters started
    pub fn error_rate(&self) -> f64 {
        self.total_errors as f64 / self.uptime_seconds.max(1) as f64
    }
}

fn recovery_rate(successes: u64, attempts: u64) -> Option<f64> {
    (attempts > 0).then(|| successes as f64 / attempts as f64 * 100.0)
}

fn format_recovery_rate(successes: u64, attempts: u64) -> String {
    match recovery_rate(successes, attempts) {
        Some(rate) => format!("{:.2}%", rate),
        None => "0%".to_string(),
    }
}

/// Shared error counters
#[derive(Debug)]
pub struct MetricsAggregator {
    state: Arc<Mutex<MetricsState>>,
    frequency_ttl: chrono::Duration,
    cleanup: PeriodicTask,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState::new(Utc::now()))),
            frequency_ttl: frequency_ttl(config.frequency_ttl_secs),
            cleanup: PeriodicTask::new(
                "metrics-cleanup",
                Duration::from_secs(config.cleanup_interval_secs.max(1)),
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        lock_state(&self.state)
    }

    /// Counts one handled error
    pub fn record_error(&self, category: ErrorCategory, severity: Severity, endpoint: &str) {
        self.record_error_at(category, severity, endpoint, Utc::now());
    }

    pub fn record_error_at(
        &self,
        category: ErrorCategory,
        severity: Severity,
        endpoint: &str,
        now: DateTime<Utc>,
    ) {
        {
            let mut state = self.lock();
            state.total_errors += 1;
            *state.errors_by_category.entry(category).or_insert(0) += 1;
            *state.errors_by_severity.entry(severity).or_insert(0) += 1;
            *state.errors_by_endpoint.entry(endpoint.to_string()).or_insert(0) += 1;

            let frequency = state
                .error_frequency
                .entry(format!("{}:{}", category, endpoint))
                .or_insert(FrequencyEntry { count: 0, last_seen: now });
            frequency.count += 1;
            frequency.last_seen = now;
        }

        counter!(
            "handled_errors_total",
            1,
            "category" => category.as_str(),
            "severity" => severity.as_str()
        );
    }

    /// Counts one recovery chain and its outcome
    pub fn record_recovery(&self, success: bool) {
        let rate = {
            let mut state = self.lock();
            state.recovery_attempts += 1;
            if success {
                state.successful_recoveries += 1;
            }
            recovery_rate(state.successful_recoveries, state.recovery_attempts)
        };

        counter!("recovery_attempts_total", 1);
        if success {
            counter!("recovery_success_total", 1);
        }
        if let Some(rate) = rate {
            gauge!("recovery_rate_percent", rate);
        }
    }

    pub fn record_cascade_failure(&self) {
        self.lock().cascade_failures += 1;
        counter!("cascade_failures_total", 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        MetricsSnapshot {
            total_errors: state.total_errors,
            errors_by_category: state.errors_by_category.clone(),
            errors_by_severity: state.errors_by_severity.clone(),
            errors_by_endpoint: state.errors_by_endpoint.clone(),
            recovery_attempts: state.recovery_attempts,
            successful_recoveries: state.successful_recoveries,
            cascade_failures: state.cascade_failures,
            error_frequency: state.error_frequency.clone(),
            recovery_rate: format_recovery_rate(state.successful_recoveries, state.recovery_attempts),
            uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        }
    }

    /// Removes frequency entries not seen within the TTL; returns how many
    pub fn prune_stale(&self) -> usize {
        prune_frequency(&self.state, self.frequency_ttl, Utc::now())
    }

    pub fn prune_stale_at(&self, now: DateTime<Utc>) -> usize {
        prune_frequency(&self.state, self.frequency_ttl, now)
    }

    /// Starts the periodic frequency sweep
    pub fn start_cleanup(&self) -> bool {
        let state = Arc::clone(&self.state);
        let ttl = self.frequency_ttl;
        self.cleanup.start(move || {
            prune_frequency(&state, ttl, Utc::now());
        })
    }

    pub fn stop_cleanup(&self) {
        self.cleanup.stop();
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.is_running()
    }

    /// Zeroes every counter and restarts the error-rate clock
    pub fn reset(&self) {
        *self.lock() = MetricsState::new(Utc::now());
        debug!("Error metrics reset");
    }
}

/// Out-of-range TTLs are clamped instead of panicking at construction
fn frequency_ttl(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs))
        .unwrap_or_else(|_| chrono::Duration::days(MAX_FREQUENCY_TTL_DAYS))
}

fn lock_state(state: &Mutex<MetricsState>) -> MutexGuard<'_, MetricsState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

fn prune_frequency(state: &Mutex<MetricsState>, ttl: chrono::Duration, now: DateTime<Utc>) -> usize {
    let mut state = lock_state(state);
    let before = state.error_frequency.len();
    state.error_frequency.retain(|_, entry| now - entry.last_seen <= ttl);
    let removed = before - state.error_frequency.len();
    if removed > 0 {
        debug!(removed, remaining = state.error_frequency.len(), "Pruned stale error frequency entries");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(&MetricsConfig::default())
    }

    #[test]
    fn test_record_error_counts_every_dimension() {
        let metrics = aggregator();
        metrics.record_error(ErrorCategory::Database, Severity::High, "GET /api/products");
        metrics.record_error(ErrorCategory::Database, Severity::Critical, "GET /api/products");
        metrics.record_error(ErrorCategory::Validation, Severity::Low, "POST /api/orders");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_errors, 3);
        assert_eq!(snapshot.category_count(ErrorCategory::Database), 2);
        assert_eq!(snapshot.errors_by_severity.get(&Severity::Low), Some(&1));
        assert_eq!(snapshot.errors_by_endpoint.get("GET /api/products"), Some(&2));
        assert_eq!(
            snapshot.error_frequency.get("DATABASE:GET /api/products").map(|e| e.count),
            Some(2)
        );
        assert_eq!(snapshot.critical_errors(), 1);
    }

    #[test]
    fn test_recovery_rate_sentinel_and_format() {
        let metrics = aggregator();
        assert_eq!(metrics.snapshot().recovery_rate, "0%");
        assert_eq!(metrics.snapshot().recovery_rate_percent(), None);

        metrics.record_recovery(true);
        metrics.record_recovery(true);
        metrics.record_recovery(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recovery_rate, "66.67%");
        assert_eq!(snapshot.recovery_attempts, 3);
        assert_eq!(snapshot.successful_recoveries, 2);
    }

    #[test]
    fn test_prune_stale_frequency_entries() {
        let metrics = aggregator();
        let start = Utc::now();
        metrics.record_error_at(ErrorCategory::Network, Severity::Medium, "GET /old", start);
        metrics.record_error_at(
            ErrorCategory::Network,
            Severity::Medium,
            "GET /new",
            start + chrono::Duration::minutes(50),
        );

        let removed = metrics.prune_stale_at(start + chrono::Duration::minutes(61));
        assert_eq!(removed, 1);

        let snapshot = metrics.snapshot();
        assert!(snapshot.error_frequency.contains_key("NETWORK:GET /new"));
        // only the frequency map is swept
        assert_eq!(snapshot.errors_by_endpoint.get("GET /old"), Some(&1));
    }

    #[test]
    fn test_reset() {
        let metrics = aggregator();
        metrics.record_error(ErrorCategory::System, Severity::High, "GET /");
        metrics.record_cascade_failure();
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_errors, 0);
        assert_eq!(snapshot.cascade_failures, 0);
        assert!(snapshot.error_frequency.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let metrics = aggregator();
        metrics.record_error(ErrorCategory::ExternalService, Severity::High, "POST /api/payments");
        let value = serde_json::to_value(metrics.snapshot()).unwrap();

        assert_eq!(value["totalErrors"], 1);
        assert_eq!(value["errorsByCategory"]["EXTERNAL_SERVICE"], 1);
        assert_eq!(value["errorsBySeverity"]["HIGH"], 1);
        assert_eq!(value["recoveryRate"], "0%");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_lifecycle() {
        let metrics = aggregator();
        // already older than the one hour TTL when the sweep runs
        metrics.record_error_at(
            ErrorCategory::Database,
            Severity::High,
            "GET /api/stale",
            Utc::now() - chrono::Duration::hours(2),
        );
        metrics.record_error(ErrorCategory::Network, Severity::High, "GET /api/fresh");

        assert!(metrics.start_cleanup());
        assert!(!metrics.start_cleanup());
        assert!(metrics.is_cleanup_running());

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(metrics.snapshot().error_frequency.len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let frequency = metrics.snapshot().error_frequency;
        assert_eq!(frequency.len(), 1);
        assert!(frequency.contains_key("NETWORK:GET /api/fresh"));

        metrics.stop_cleanup();
        assert!(!metrics.is_cleanup_running());
    }

    #[test]
    fn test_out_of_range_ttl_is_clamped() {
        let metrics = MetricsAggregator::new(&MetricsConfig {
            frequency_ttl_secs: u64::MAX,
            ..MetricsConfig::default()
        });
        metrics.record_error_at(
            ErrorCategory::System,
            Severity::Medium,
            "GET /",
            Utc::now() - chrono::Duration::days(365),
        );

        assert_eq!(metrics.prune_stale(), 0);
        assert_eq!(frequency_ttl(60), chrono::Duration::seconds(60));
        assert_eq!(frequency_ttl(u64::MAX), chrono::Duration::days(MAX_FREQUENCY_TTL_DAYS));
    }
}
