//! # Error Classification
//!
//! Maps an [`AppError`] to a `(category, severity)` pair by walking an ordered
//! rule table. The first matching rule wins; nothing matching yields
//! `SYSTEM/MEDIUM`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{AppError, ErrorCategory, Severity};

/// What a rule inspects on the error
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Technical message matches the pattern
    Message(Regex),
    /// Type name matches the pattern
    Name(Regex),
    /// Type name or error code matches the pattern
    NameOrCode(Regex),
    /// Status code is at least the given value
    StatusAtLeast(u16),
}

impl RuleMatcher {
    fn matches(&self, error: &AppError) -> bool {
        match self {
            RuleMatcher::Message(pattern) => pattern.is_match(&error.message),
            RuleMatcher::Name(pattern) => pattern.is_match(&error.name),
            RuleMatcher::NameOrCode(pattern) => {
                pattern.is_match(&error.name) || pattern.is_match(&error.code)
            }
            RuleMatcher::StatusAtLeast(status) => error.status_code >= *status,
        }
    }
}

/// A single `predicate -> outcome` row
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub name: &'static str,
    pub matcher: RuleMatcher,
    pub category: ErrorCategory,
    pub severity: Severity,
}

/// Result of classifying one error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
}

/// Pure, rule-ordered classifier
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
    fallback: Classification,
}

impl ErrorClassifier {
    /// Builds the classifier with the standard rule table
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Builds a classifier over a custom rule table
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self {
            rules,
            fallback: Classification {
                category: ErrorCategory::System,
                severity: Severity::Medium,
            },
        }
    }

    /// Classifies an error; identical input always yields identical output
    pub fn classify(&self, error: &AppError) -> Classification {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(error))
            .map(|rule| Classification {
                category: rule.category,
                severity: rule.severity,
            })
            .unwrap_or(self.fallback)
    }

    /// Name of the rule that would fire, for diagnostics
    pub fn matching_rule(&self, error: &AppError) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(error))
            .map(|rule| rule.name)
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn pattern(source: &str) -> Regex {
    // patterns are compile-time literals covered by tests
    Regex::new(source).unwrap_or_else(|e| panic!("invalid classification pattern {}: {}", source, e))
}

static DEFAULT_RULES: Lazy<Vec<ClassificationRule>> = Lazy::new(build_default_rules);

/// The standard ordered rule table, compiled once per process
pub fn default_rules() -> Vec<ClassificationRule> {
    DEFAULT_RULES.clone()
}

fn build_default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            name: "database",
            matcher: RuleMatcher::Message(pattern(r"(?i)database|connection")),
            category: ErrorCategory::Database,
            severity: Severity::High,
        },
        ClassificationRule {
            name: "network",
            matcher: RuleMatcher::Message(pattern(r"(?i)network|timeout")),
            category: ErrorCategory::Network,
            severity: Severity::Medium,
        },
        ClassificationRule {
            name: "authentication",
            matcher: RuleMatcher::Name(pattern(
                r"^(Unauthorized|Forbidden|Authentication|Authorization|JsonWebToken|TokenExpired)(Error)?$",
            )),
            category: ErrorCategory::Authentication,
            severity: Severity::Low,
        },
        ClassificationRule {
            name: "validation",
            matcher: RuleMatcher::NameOrCode(pattern(r"(?i)validation")),
            category: ErrorCategory::Validation,
            severity: Severity::Low,
        },
        ClassificationRule {
            name: "external-service",
            matcher: RuleMatcher::Name(pattern(r"^ExternalServiceError$")),
            category: ErrorCategory::ExternalService,
            severity: Severity::High,
        },
        ClassificationRule {
            name: "server-status",
            matcher: RuleMatcher::StatusAtLeast(500),
            category: ErrorCategory::System,
            severity: Severity::High,
        },
    ]
}
