//! # Resilience Engine
//!
//! Error correlation, cascade-failure detection and recovery orchestration
//! for the tail of an HTTP request pipeline.
//!
//! ## Features
//!
//! - Rule-ordered classification into category and severity
//! - Time-windowed correlation of recurring failures
//! - Cascade detection that forces the failing endpoint's circuit open
//! - Bounded, category-specific recovery strategies
//! - Aggregated metrics, threshold alerts and error reports
//! - A uniform client-facing error body that never fails to render
//!

pub mod alerts;
pub mod cascade;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod context;
pub mod correlation;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod reporting;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use types::{AppError, EngineError, ErrorCategory, Result, Severity};
pub use context::RequestContext;
pub use crate::config::EngineConfig;
pub use logging::{init_logging, LoggingConfig};
pub use classifier::{Classification, ErrorClassifier};
pub use correlation::{CorrelationResult, ErrorCorrelator};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use recovery::{RecoveryOutcome, RecoveryStrategy};
pub use alerts::{AlertEvent, AlertKind, MonitorState};
pub use reporting::ErrorReport;
pub use handler::{JsonResponseRenderer, RenderedResponse, ResilienceEngine, ResponseRenderer};

/// Loads configuration, initializes logging and builds the engine
pub fn init() -> Result<ResilienceEngine> {
    let config = EngineConfig::load()?;
    init_logging(Some(config.logging.clone()))?;
    Ok(ResilienceEngine::new(config))
}

/// Builds the engine from an explicit configuration
pub fn init_with_config(config: EngineConfig) -> Result<ResilienceEngine> {
    init_logging(Some(config.logging.clone()))?;
    Ok(ResilienceEngine::new(config))
}
