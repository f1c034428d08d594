//! # Error Reports
//!
//! Operator-facing summary of the engine's state with remediation hints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::CircuitHealth;
use crate::correlation::GroupSummary;
use crate::metrics::MetricsSnapshot;
use crate::types::ErrorCategory;

/// Number of correlation groups listed in a report
pub const TOP_CORRELATIONS: usize = 10;

const DATABASE_SHARE: f64 = 0.30;
const NETWORK_SHARE: f64 = 0.20;
const VALIDATION_SHARE: f64 = 0.40;
const MIN_RECOVERY_RATE: f64 = 80.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub generated_at: DateTime<Utc>,
    pub summary: MetricsSnapshot,
    pub top_correlations: Vec<GroupSummary>,
    pub breakers: Vec<CircuitHealth>,
    pub recommendations: Vec<String>,
}

impl ErrorReport {
    pub fn new(
        summary: MetricsSnapshot,
        top_correlations: Vec<GroupSummary>,
        breakers: Vec<CircuitHealth>,
    ) -> Self {
        let recommendations = recommendations(&summary);
        Self {
            generated_at: Utc::now(),
            summary,
            top_correlations,
            breakers,
            recommendations,
        }
    }
}

/// Remediation hints derived from the error mix
pub fn recommendations(summary: &MetricsSnapshot) -> Vec<String> {
    if summary.total_errors == 0 {
        return vec!["No errors recorded; no action required.".to_string()];
    }

    let mut hints = Vec::new();

    if summary.category_share(ErrorCategory::Database) > DATABASE_SHARE {
        hints.push(
            "High share of database errors: review connection pool sizing and add indexes for slow queries."
                .to_string(),
        );
    }
    if summary.category_share(ErrorCategory::Network) > NETWORK_SHARE {
        hints.push(
            "Frequent network errors: tune upstream timeouts and set retry budgets.".to_string(),
        );
    }
    if summary.cascade_failures > 0 {
        hints.push(format!(
            "{} cascade failure(s) detected: review circuit breaker thresholds for the affected endpoints.",
            summary.cascade_failures
        ));
    }
    if let Some(rate) = summary.recovery_rate_percent() {
        if rate < MIN_RECOVERY_RATE {
            hints.push(format!(
                "Recovery rate is {:.2}%: review recovery strategies and fallback coverage.",
                rate
            ));
        }
    }
    if summary.category_share(ErrorCategory::Validation) > VALIDATION_SHARE {
        hints.push(
            "Most errors are validation failures: strengthen client-side validation.".to_string(),
        );
    }

    hints
}
