//! # Engine Configuration
//!
//! Layered configuration: compiled defaults, then an optional config file,
//! then `RESILIENCE_*` environment variables with `__` between nested keys,
//! e.g. `RESILIENCE_CASCADE__COUNT_THRESHOLD=100`. A `.env` file is honoured.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;
use crate::types::Result;

/// Environment variable naming the config file (without extension)
pub const CONFIG_PATH_VAR: &str = "RESILIENCE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/resilience";
const ENV_PREFIX: &str = "RESILIENCE";

/// Top-level configuration for the resilience engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deployment environment (development, staging, production)
    pub environment: String,
    pub logging: LoggingConfig,
    pub correlation: CorrelationConfig,
    pub cascade: CascadeConfig,
    pub recovery: RecoveryConfig,
    pub metrics: MetricsConfig,
    pub alerts: AlertConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            logging: LoggingConfig::default(),
            correlation: CorrelationConfig::default(),
            cascade: CascadeConfig::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the default sources
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Loads configuration from the given file (optional) and the environment
    pub fn load_from(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Development mode exposes stacks, details and correlation data
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Convenience constructor used by tests and local tooling
    pub fn development() -> Self {
        Self {
            environment: "development".to_string(),
            ..Self::default()
        }
    }
}

/// Correlation window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Events older than this no longer count as related
    pub window_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { window_ms: 60_000 }
    }
}

impl CorrelationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Thresholds both of which must be exceeded to declare a cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Events inside the correlation window
    pub frequency_threshold: usize,
    /// Lifetime occurrences of the correlation key
    pub count_threshold: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            frequency_threshold: 10,
            count_threshold: 50,
        }
    }
}

/// Delay and attempt limits for the waiting recovery strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_max_attempts: u32,
    pub jitter_base_ms: u64,
    pub jitter_range_ms: u64,
    pub jitter_max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_max_attempts: 3,
            jitter_base_ms: 1_000,
            jitter_range_ms: 1_000,
            jitter_max_attempts: 5,
        }
    }
}

/// Aggregated counter housekeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How often stale frequency entries are swept
    pub cleanup_interval_secs: u64,
    /// Frequency entries untouched for longer than this are removed
    pub frequency_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 300,
            frequency_ttl_secs: 3_600,
        }
    }
}

/// Alert monitor cadence and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub check_interval_secs: u64,
    /// Errors per elapsed second (0.1 = 10%)
    pub error_rate: f64,
    pub cascade_failures: u64,
    pub critical_errors: u64,
    /// Minimum acceptable recovery rate, in percent
    pub recovery_rate: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            error_rate: 0.1,
            cascade_failures: 5,
            critical_errors: 3,
            recovery_rate: 95.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert!(!config.is_development());
        assert_eq!(config.correlation.window(), Duration::from_secs(60));
        assert_eq!(config.cascade.frequency_threshold, 10);
        assert_eq!(config.cascade.count_threshold, 50);
        assert_eq!(config.recovery.backoff_max_attempts, 3);
        assert_eq!(config.recovery.jitter_max_attempts, 5);
        assert_eq!(config.metrics.cleanup_interval_secs, 300);
        assert_eq!(config.alerts.check_interval_secs, 30);
    }

    #[test]
    fn test_development_flag() {
        assert!(EngineConfig::development().is_development());

        let config = EngineConfig {
            environment: "Development".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.is_development());
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"environment": "staging", "cascade": {"count_threshold": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.cascade.count_threshold, 5);
        assert_eq!(config.cascade.frequency_threshold, 10);
        assert_eq!(config.recovery.backoff_base_ms, 1_000);
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let config = EngineConfig::load_from("does/not/exist").unwrap();
        assert_eq!(config.correlation.window_ms, 60_000);
    }
}
