//! # Error Handler Entry Point
//!
//! [`ResilienceEngine`] owns every stateful component and exposes the single
//! request-path operation, [`ResilienceEngine::handle`]. The pipeline is:
//!
//! 1. classify
//! 2. correlate
//! 3. cascade check (may force the endpoint's breaker open)
//! 4. recovery, for HIGH severity and above
//! 5. metrics, then logging
//! 6. render
//!
//! The whole pipeline runs behind a guard that turns internal failures and
//! panics into a fixed minimal 500 body, so `handle` never fails.

use std::any::Any;
use std::error::Error as StdError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::alerts::{AlertEvent, AlertMonitor, MonitoringStatus};
use crate::cascade::CascadeDetector;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::ErrorClassifier;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::correlation::{generate_key, CorrelationResult, ErrorCorrelator};
use crate::logging::{log_handled_error, LogCorrelation};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::recovery::{RecoveryOrchestrator, RecoveryOutcome};
use crate::reporting::{ErrorReport, TOP_CORRELATIONS};
use crate::types::{iso_timestamp, AppError, EngineError, ErrorCategory, Result, Severity};

const CASCADE_STATUS: u16 = 503;
const RECOVERED_STATUS: u16 = 200;
const FALLBACK_STATUS: u16 = 500;

/// Final response handed back to the web layer
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub status_code: u16,
    pub body: Value,
    /// Whether the recovery chain ran for this error
    pub recovery_attempted: bool,
}

/// Everything known about an error once the pipeline has run
#[derive(Debug)]
pub struct HandledError<'a> {
    pub error: &'a AppError,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: &'a RequestContext,
    pub correlation: &'a CorrelationResult,
    pub cascade: bool,
    pub recovery: Option<&'a RecoveryOutcome>,
    /// Status after cascade and recovery adjustments
    pub status_code: u16,
    pub is_development: bool,
}

/// Turns a handled error into the response body
pub trait ResponseRenderer: Send + Sync {
    fn render(&self, handled: &HandledError<'_>) -> Result<Value>;
}

/// Standard JSON error envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseRenderer;

impl ResponseRenderer for JsonResponseRenderer {
    fn render(&self, handled: &HandledError<'_>) -> Result<Value> {
        let mut body = handled.error.to_json(handled.is_development);
        let Value::Object(map) = &mut body else {
            return Err(EngineError::Render("error body is not an object".to_string()));
        };

        map.insert("category".to_string(), json!(handled.category));
        map.insert("path".to_string(), json!(handled.context.path));
        map.insert("requestId".to_string(), json!(handled.context.request_id));

        let recovered = handled.recovery.filter(|r| r.success && handled.severity < Severity::Critical);
        if let Some(recovery) = recovered {
            map.insert(
                "recovery".to_string(),
                json!({
                    "applied": true,
                    "action": recovery.action,
                    "message": recovery.message(),
                }),
            );
        }

        let correlation = handled.correlation;
        if handled.is_development || correlation.frequency > 1 {
            map.insert(
                "correlation".to_string(),
                json!({
                    "key": correlation.key,
                    "frequency": correlation.frequency,
                    "isRecurring": correlation.is_recurring,
                    "relatedErrors": correlation.related_count,
                }),
            );
        }

        if handled.status_code >= 500 && !handled.is_development {
            for field in ["details", "stack", "correlation"] {
                map.remove(field);
            }
        }

        Ok(body)
    }
}

/// The error correlation, cascade detection and recovery engine
pub struct ResilienceEngine {
    config: EngineConfig,
    classifier: ErrorClassifier,
    correlator: ErrorCorrelator,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    cascade: CascadeDetector,
    recovery: RecoveryOrchestrator,
    alerts: AlertMonitor,
    renderer: Arc<dyn ResponseRenderer>,
}

impl ResilienceEngine {
    pub fn new(config: EngineConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(None));
        let metrics = Arc::new(MetricsAggregator::new(&config.metrics));

        Self {
            classifier: ErrorClassifier::new(),
            correlator: ErrorCorrelator::new(config.correlation.window()),
            cascade: CascadeDetector::new(
                config.cascade.clone(),
                Arc::clone(&breakers),
                Arc::clone(&metrics),
            ),
            recovery: RecoveryOrchestrator::new(config.recovery.clone(), Arc::clone(&breakers)),
            alerts: AlertMonitor::new(config.alerts.clone(), Arc::clone(&metrics)),
            renderer: Arc::new(JsonResponseRenderer),
            breakers,
            metrics,
            config,
        }
    }

    /// Builds an engine from the default configuration sources
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(EngineConfig::load()?))
    }

    /// Replaces the response renderer
    pub fn with_renderer<R: ResponseRenderer + 'static>(mut self, renderer: R) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    /// Replaces the classifier rule table
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Handles a failed request. Never fails and never panics.
    pub async fn handle(&self, error: AppError, ctx: &RequestContext) -> RenderedResponse {
        match AssertUnwindSafe(self.process(error, ctx)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    error = %e,
                    "Error handler failed"
                );
                fallback_response(&ctx.request_id)
            }
            Err(panic) => {
                error!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    panic = %panic_message(panic.as_ref()),
                    "Error handler panicked"
                );
                fallback_response(&ctx.request_id)
            }
        }
    }

    /// Wraps a foreign error and handles it
    pub async fn handle_error<E>(&self, error: E, ctx: &RequestContext) -> RenderedResponse
    where
        E: StdError + Send + Sync + 'static,
    {
        self.handle(AppError::wrap(error), ctx).await
    }

    async fn process(&self, error: AppError, ctx: &RequestContext) -> Result<RenderedResponse> {
        let classification = self.classifier.classify(&error);
        let category = classification.category;
        let severity = classification.severity.max(error.declared_severity());

        let key = generate_key(&error, ctx);
        let correlation = self.correlator.record_error(&key, &error, ctx);

        let endpoint = ctx.endpoint();
        let cascade = self.cascade.check(&correlation, &endpoint);

        let mut status_code = if cascade { CASCADE_STATUS } else { error.status_code };

        let recovery = if severity.requires_recovery() {
            let outcome = self.recovery.attempt_recovery(&error, category, ctx).await;
            self.metrics.record_recovery(outcome.success);
            Some(outcome)
        } else {
            None
        };

        // critical errors keep their status even when a strategy succeeded
        if recovery.as_ref().is_some_and(|r| r.success) && severity < Severity::Critical {
            status_code = RECOVERED_STATUS;
        }

        self.metrics.record_error(category, severity, &endpoint);

        log_handled_error(
            &error,
            category,
            severity,
            ctx,
            LogCorrelation {
                key: &correlation.key,
                status_code,
                frequency: correlation.frequency,
                cascade,
                recovered: recovery.as_ref().is_some_and(|r| r.success),
            },
        );

        let handled = HandledError {
            error: &error,
            category,
            severity,
            context: ctx,
            correlation: &correlation,
            cascade,
            recovery: recovery.as_ref(),
            status_code,
            is_development: self.config.is_development(),
        };
        let body = self.renderer.render(&handled)?;

        Ok(RenderedResponse {
            status_code,
            body,
            recovery_attempted: recovery.is_some(),
        })
    }

    // -- Administrative operations --

    pub fn get_monitoring_status(&self) -> MonitoringStatus {
        self.alerts.status()
    }

    pub fn start_monitoring(&self) -> bool {
        self.alerts.start_monitoring()
    }

    pub fn stop_monitoring(&self) {
        self.alerts.stop_monitoring();
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_error_report(&self) -> ErrorReport {
        ErrorReport::new(
            self.metrics.snapshot(),
            self.correlator.top_groups(TOP_CORRELATIONS),
            self.breakers.all_status(),
        )
    }

    /// Receives alert events as the monitor emits them
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    /// Starts the background cleanup and alert monitor
    pub fn start(&self) {
        let cleanup = self.metrics.start_cleanup();
        let monitoring = self.alerts.start_monitoring();
        info!(cleanup, monitoring, environment = %self.config.environment, "Resilience engine started");
    }

    /// Stops every background task
    pub fn shutdown(&self) {
        self.alerts.stop_monitoring();
        self.metrics.stop_cleanup();
        info!("Resilience engine stopped");
    }

    /// Clears all in-memory state
    pub fn reset(&self) {
        self.correlator.clear();
        self.metrics.reset();
        self.recovery.reset();
        self.breakers.clear();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn correlator(&self) -> &ErrorCorrelator {
        &self.correlator
    }
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("environment", &self.config.environment)
            .field("correlation_groups", &self.correlator.len())
            .field("breakers", &self.breakers.names())
            .field("monitoring", &self.alerts.state())
            .finish()
    }
}

/// The only body produced when the pipeline itself fails
pub fn fallback_response(request_id: &str) -> RenderedResponse {
    RenderedResponse {
        status_code: FALLBACK_STATUS,
        body: json!({
            "success": false,
            "error": "InternalServerError",
            "message": "An unexpected error occurred",
            "requestId": request_id,
            "timestamp": iso_timestamp(&Utc::now()),
        }),
        recovery_attempted: false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
