//! # Alert Monitoring
//!
//! Periodically compares the aggregated metrics against alert thresholds.
//! Every crossed threshold produces one event per check; there is no
//! suppression window, so a threshold that stays crossed re-alerts on every
//! tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::AlertConfig;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::scheduler::PeriodicTask;
use crate::types::Severity;

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Which threshold an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    HighErrorRate,
    CascadeFailures,
    CriticalErrors,
    LowRecoveryRate,
}

impl AlertKind {
    fn severity(&self) -> Severity {
        match self {
            AlertKind::HighErrorRate => Severity::High,
            AlertKind::CascadeFailures | AlertKind::CriticalErrors => Severity::Critical,
            AlertKind::LowRecoveryRate => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    fn new(kind: AlertKind, message: String, value: f64, threshold: f64) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message,
            value,
            threshold,
            timestamp: Utc::now(),
        }
    }
}

/// Thresholds crossed by a snapshot, in a fixed order
pub fn evaluate_thresholds(snapshot: &MetricsSnapshot, config: &AlertConfig) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();

    // errors per elapsed second, not per request
    let error_rate = snapshot.error_rate();
    if error_rate > config.error_rate {
        alerts.push(AlertEvent::new(
            AlertKind::HighErrorRate,
            format!("High error rate: {:.2}%", error_rate * 100.0),
            error_rate,
            config.error_rate,
        ));
    }

    if snapshot.cascade_failures > config.cascade_failures {
        alerts.push(AlertEvent::new(
            AlertKind::CascadeFailures,
            format!("Cascade failures detected: {}", snapshot.cascade_failures),
            snapshot.cascade_failures as f64,
            config.cascade_failures as f64,
        ));
    }

    let critical = snapshot.critical_errors();
    if critical > config.critical_errors {
        alerts.push(AlertEvent::new(
            AlertKind::CriticalErrors,
            format!("Critical errors: {}", critical),
            critical as f64,
            config.critical_errors as f64,
        ));
    }

    if let Some(rate) = snapshot.recovery_rate_percent() {
        if rate < config.recovery_rate {
            alerts.push(AlertEvent::new(
                AlertKind::LowRecoveryRate,
                format!("Low recovery rate: {:.2}%", rate),
                rate,
                config.recovery_rate,
            ));
        }
    }

    alerts
}

/// Administrative view of the monitor
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    pub state: MonitorState,
    pub is_monitoring: bool,
    pub check_interval_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub alerts_emitted: u64,
    pub thresholds: AlertConfig,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
struct AlertEvaluator {
    config: AlertConfig,
    metrics: Arc<MetricsAggregator>,
    alert_tx: broadcast::Sender<AlertEvent>,
    last_check: Mutex<Option<DateTime<Utc>>>,
    alerts_emitted: AtomicU64,
}

impl AlertEvaluator {
    fn run_check(&self) -> Vec<AlertEvent> {
        let alerts = evaluate_thresholds(&self.metrics.snapshot(), &self.config);
        *self.last_check.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());

        for alert in &alerts {
            match alert.severity {
                Severity::Critical | Severity::Fatal => error!(
                    alert = ?alert.kind,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                ),
                _ => warn!(
                    alert = ?alert.kind,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                ),
            }
            counter!("alerts_emitted_total", 1, "kind" => format!("{:?}", alert.kind));
            // no subscribers is fine; the log line is the durable record
            let _ = self.alert_tx.send(alert.clone());
        }

        self.alerts_emitted.fetch_add(alerts.len() as u64, Ordering::Relaxed);
        alerts
    }
}

/// Background threshold checker
#[derive(Debug)]
pub struct AlertMonitor {
    evaluator: Arc<AlertEvaluator>,
    task: PeriodicTask,
}

impl AlertMonitor {
    pub fn new(config: AlertConfig, metrics: Arc<MetricsAggregator>) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let period = Duration::from_secs(config.check_interval_secs.max(1));
        Self {
            evaluator: Arc::new(AlertEvaluator {
                config,
                metrics,
                alert_tx,
                last_check: Mutex::new(None),
                alerts_emitted: AtomicU64::new(0),
            }),
            task: PeriodicTask::new("alert-monitor", period),
        }
    }

    /// STOPPED to RUNNING; a no-op when already running
    pub fn start_monitoring(&self) -> bool {
        let evaluator = Arc::clone(&self.evaluator);
        let started = self.task.start(move || {
            evaluator.run_check();
        });
        if started {
            info!(
                interval_secs = self.task.period().as_secs(),
                "Alert monitoring started"
            );
        }
        started
    }

    /// RUNNING to STOPPED
    pub fn stop_monitoring(&self) {
        if self.task.is_running() {
            self.task.stop();
            info!("Alert monitoring stopped");
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.task.is_running() {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        }
    }

    /// Runs one evaluation immediately
    pub fn check_now(&self) -> Vec<AlertEvent> {
        self.evaluator.run_check()
    }

    /// Receives every alert emitted after subscription
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.evaluator.alert_tx.subscribe()
    }

    pub fn status(&self) -> MonitoringStatus {
        let state = self.state();
        MonitoringStatus {
            state,
            is_monitoring: state == MonitorState::Running,
            check_interval_secs: self.task.period().as_secs(),
            last_check: *self.evaluator.last_check.lock().unwrap_or_else(|p| p.into_inner()),
            alerts_emitted: self.evaluator.alerts_emitted.load(Ordering::Relaxed),
            thresholds: self.evaluator.config.clone(),
            metrics: self.evaluator.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::types::ErrorCategory;
    use std::collections::HashMap;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            total_errors: 0,
            errors_by_category: HashMap::new(),
            errors_by_severity: HashMap::new(),
            errors_by_endpoint: HashMap::new(),
            recovery_attempts: 0,
            successful_recoveries: 0,
            cascade_failures: 0,
            error_frequency: HashMap::new(),
            recovery_rate: "0%".to_string(),
            uptime_seconds: 1_000,
        }
    }

    fn kinds(alerts: &[AlertEvent]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_quiet_metrics_raise_nothing() {
        let alerts = evaluate_thresholds(&snapshot(), &AlertConfig::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_each_threshold_fires_independently() {
        let config = AlertConfig::default();
        let mut s = snapshot();

        s.total_errors = 101;
        assert_eq!(kinds(&evaluate_thresholds(&s, &config)), vec![AlertKind::HighErrorRate]);

        s.total_errors = 0;
        s.cascade_failures = 6;
        assert_eq!(kinds(&evaluate_thresholds(&s, &config)), vec![AlertKind::CascadeFailures]);

        s.cascade_failures = 5;
        s.errors_by_severity.insert(Severity::Critical, 4);
        assert_eq!(kinds(&evaluate_thresholds(&s, &config)), vec![AlertKind::CriticalErrors]);

        s.errors_by_severity.clear();
        s.recovery_attempts = 20;
        s.successful_recoveries = 18;
        let alerts = evaluate_thresholds(&s, &config);
        assert_eq!(kinds(&alerts), vec![AlertKind::LowRecoveryRate]);
        assert!((alerts[0].value - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_thresholds_at_once() {
        let mut s = snapshot();
        s.total_errors = 500;
        s.cascade_failures = 10;
        s.errors_by_severity.insert(Severity::Fatal, 2);
        s.errors_by_severity.insert(Severity::Critical, 2);
        s.recovery_attempts = 2;
        s.successful_recoveries = 0;

        let alerts = evaluate_thresholds(&s, &AlertConfig::default());
        assert_eq!(
            kinds(&alerts),
            vec![
                AlertKind::HighErrorRate,
                AlertKind::CascadeFailures,
                AlertKind::CriticalErrors,
                AlertKind::LowRecoveryRate
            ]
        );
        assert_eq!(alerts[1].severity, Severity::Critical);
    }

    fn monitor() -> (AlertMonitor, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::new(&MetricsConfig::default()));
        (AlertMonitor::new(AlertConfig::default(), Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_check_now_publishes_and_repeats() {
        let (monitor, metrics) = monitor();
        let mut rx = monitor.subscribe();
        for _ in 0..4 {
            metrics.record_error(ErrorCategory::Database, Severity::Critical, "GET /api/products");
        }

        let first = monitor.check_now();
        let second = monitor.check_now();
        assert!(kinds(&first).contains(&AlertKind::CriticalErrors));
        assert_eq!(kinds(&first), kinds(&second));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, first[0].kind);
        assert_eq!(monitor.status().alerts_emitted, (first.len() + second.len()) as u64);
        assert!(monitor.status().last_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_lifecycle_and_ticks() {
        let (monitor, metrics) = monitor();
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.state(), MonitorState::Stopped);

        assert!(monitor.start_monitoring());
        assert!(!monitor.start_monitoring());
        assert_eq!(monitor.state(), MonitorState::Running);
        assert!(monitor.status().is_monitoring);

        for _ in 0..6 {
            metrics.record_cascade_failure();
        }

        tokio::time::sleep(Duration::from_secs(31)).await;
        let mut received = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            received.push(alert.kind);
        }
        assert!(received.contains(&AlertKind::CascadeFailures));

        monitor.stop_monitoring();
        monitor.stop_monitoring();
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }
}
