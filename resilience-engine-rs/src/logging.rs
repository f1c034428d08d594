//! # Structured Logging
//!
//! Subscriber setup for services embedding the engine, and the
//! severity-driven log call used for every handled error.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::context::RequestContext;
use crate::types::{AppError, EngineError, ErrorCategory, Result, Severity};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to also write daily-rolled log files
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "storefront-api".to_string(),
            json_format: true,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Initializes the structured logging system.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = NonBlocking::new(appender);
            // the guard flushes on drop; keep it for the process lifetime
            Box::leak(Box::new(guard));
            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };

    let result = if config.json_format {
        let subscriber = Registry::default()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().json().flatten_event(true).with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().with_target(true).with_thread_names(true));
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(EngineError::Logging(e.to_string()));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Log level a severity is reported at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::Fatal => LogLevel::Fatal,
            Severity::High => LogLevel::Error,
            Severity::Low | Severity::Medium => LogLevel::Warn,
        }
    }
}

/// Correlation facts attached to a handled-error log line
#[derive(Debug, Clone, Copy)]
pub struct LogCorrelation<'a> {
    pub key: &'a str,
    /// Status actually sent to the client
    pub status_code: u16,
    pub frequency: usize,
    pub cascade: bool,
    pub recovered: bool,
}

/// Logs a handled error at the level derived from its severity
pub fn log_handled_error(
    error: &AppError,
    category: ErrorCategory,
    severity: Severity,
    ctx: &RequestContext,
    correlation: LogCorrelation<'_>,
) {
    match LogLevel::for_severity(severity) {
        LogLevel::Fatal => {
            error!(
                fatal = true,
                error_id = %error.id,
                error_name = %error.name,
                code = %error.code,
                category = %category,
                severity = %severity,
                status = correlation.status_code,
                original_status = error.status_code,
                method = %ctx.method,
                path = %ctx.path,
                request_id = %ctx.request_id,
                user_id = %ctx.actor(),
                correlation_key = %correlation.key,
                frequency = correlation.frequency,
                cascade = correlation.cascade,
                recovered = correlation.recovered,
                error_message = %error.message,
                stack = ?error.stack,
                "Critical error handled"
            );
        }
        LogLevel::Error => {
            error!(
                error_id = %error.id,
                error_name = %error.name,
                code = %error.code,
                category = %category,
                severity = %severity,
                status = correlation.status_code,
                original_status = error.status_code,
                method = %ctx.method,
                path = %ctx.path,
                request_id = %ctx.request_id,
                correlation_key = %correlation.key,
                frequency = correlation.frequency,
                cascade = correlation.cascade,
                recovered = correlation.recovered,
                error_message = %error.message,
                "Error handled"
            );
        }
        LogLevel::Warn => {
            warn!(
                error_id = %error.id,
                error_name = %error.name,
                code = %error.code,
                category = %category,
                severity = %severity,
                status = correlation.status_code,
                original_status = error.status_code,
                method = %ctx.method,
                path = %ctx.path,
                request_id = %ctx.request_id,
                frequency = correlation.frequency,
                error_message = %error.message,
                "Request failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_level_for_severity() {
        assert_eq!(LogLevel::for_severity(Severity::Fatal), LogLevel::Fatal);
        assert_eq!(LogLevel::for_severity(Severity::Critical), LogLevel::Fatal);
        assert_eq!(LogLevel::for_severity(Severity::High), LogLevel::Error);
        assert_eq!(LogLevel::for_severity(Severity::Medium), LogLevel::Warn);
        assert_eq!(LogLevel::for_severity(Severity::Low), LogLevel::Warn);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handled_error_logs_resolved_status() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let error = AppError::conflict("cart version mismatch");
        let ctx = RequestContext::new("PUT", "/api/cart");
        tracing::subscriber::with_default(subscriber, || {
            log_handled_error(
                &error,
                ErrorCategory::System,
                Severity::Medium,
                &ctx,
                LogCorrelation {
                    key: "ConflictError:PUT:/api/cart:anonymous",
                    status_code: 503,
                    frequency: 12,
                    cascade: true,
                    recovered: false,
                },
            );
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("status=503"), "{}", output);
        assert!(output.contains("original_status=409"), "{}", output);
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig {
            json_format: false,
            ..LoggingConfig::default()
        };
        // another test binary may already own the global subscriber
        let _ = init_logging(Some(config.clone()));
        assert!(init_logging(Some(config)).is_ok());
    }
}
