//! # Error Taxonomy
//!
//! Client-facing application errors, the category/severity taxonomy the engine
//! classifies them into, and the engine's own internal error type.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to [`EngineError`]
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failures raised inside the engine while handling another error.
///
/// These never reach the caller of `handle`; the outer guard turns them into
/// the minimal 500 body.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("response rendering failed: {0}")]
    Render(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("logging initialization failed: {0}")]
    Logging(String),

    #[error("recovery strategy {strategy} failed: {message}")]
    Strategy { strategy: String, message: String },
}

/// The severity level of a handled error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Expected client-side problem
    Low,
    /// Degraded but contained
    Medium,
    /// Server-side failure worth recovering from
    High,
    /// Severe failure; status is never overridden
    Critical,
    /// Process-threatening failure
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
            Severity::Fatal => "FATAL",
        }
    }

    /// Only HIGH and above enter the recovery chain
    pub fn requires_recovery(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorizes handled errors by the subsystem that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Database queries or connections
    Database,
    /// Network transport or timeouts
    Network,
    /// Third-party services (payments, mail, ...)
    ExternalService,
    /// Missing or invalid credentials
    Authentication,
    /// Authenticated but not permitted
    Authorization,
    /// Request payload failed validation
    Validation,
    /// Malformed user input outside schema validation
    UserInput,
    /// Anything unclassified
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Database => "DATABASE",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::ExternalService => "EXTERNAL_SERVICE",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Authorization => "AUTHORIZATION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::UserInput => "USER_INPUT",
            ErrorCategory::System => "SYSTEM",
        }
    }

    /// Severity a category carries when nothing escalates it
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCategory::Database | ErrorCategory::ExternalService => Severity::High,
            ErrorCategory::Network | ErrorCategory::System => Severity::Medium,
            ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Validation
            | ErrorCategory::UserInput => Severity::Low,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_CODE: &str = "INTERNAL_ERROR";
const DEFAULT_USER_MESSAGE: &str = "An error occurred. Please try again.";

/// Application error as seen by the request pipeline.
///
/// Every failure reaching the engine is either one of the taxonomy
/// constructors below or a foreign error wrapped with [`AppError::wrap`].
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppError {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// Type name used in responses and correlation keys
    pub name: String,
    /// Machine-readable error code (UPPER_SNAKE_CASE)
    pub code: String,
    /// Technical message (for logs and classification)
    pub message: String,
    /// Safe message for clients
    pub user_message: String,
    /// HTTP status code
    pub status_code: u16,
    /// Expected (user/business) error vs programming error
    pub is_operational: bool,
    /// Severity declared by the error itself, if any
    pub severity: Option<Severity>,
    /// Additional context rendered as `details`
    pub context: Map<String, Value>,
    /// When the error occurred
    pub timestamp: DateTime<Utc>,
    /// Stack text, rendered only in development
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Underlying cause (not serialized)
    #[serde(skip)]
    pub cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl AppError {
    /// Creates a generic application error (500, operational)
    pub fn new<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        let stack = capture_stack("AppError", &message);
        Self {
            id: Uuid::new_v4(),
            name: "AppError".to_string(),
            code: DEFAULT_CODE.to_string(),
            message,
            user_message: DEFAULT_USER_MESSAGE.to_string(),
            status_code: 500,
            is_operational: true,
            severity: None,
            context: Map::new(),
            timestamp: Utc::now(),
            stack,
            cause: None,
        }
    }

    /// Sets the type name
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        if let Some(stack) = self.stack.as_mut() {
            let updated = stack_with_header(&self.name, &self.message, stack.as_str());
            *stack = updated;
        }
        self
    }

    /// Sets the HTTP status code
    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Sets the error code
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = code.into();
        self
    }

    /// Sets the client-facing message
    pub fn user_message<S: Into<String>>(mut self, message: S) -> Self {
        self.user_message = message.into();
        self
    }

    /// Declares the error's own severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Marks the error as operational or programming error
    pub fn operational(mut self, is_operational: bool) -> Self {
        self.is_operational = is_operational;
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Severity the error declares, falling back to its status class
    pub fn declared_severity(&self) -> Severity {
        self.severity.unwrap_or(if self.status_code >= 500 {
            Severity::High
        } else {
            Severity::Medium
        })
    }

    /// Name exposed in the `error` field of responses
    pub fn public_name(&self) -> &str {
        // clients match on "validation" rather than the type name
        if self.name == "ValidationError" {
            "validation"
        } else {
            &self.name
        }
    }

    /// Base response body for this error
    pub fn to_json(&self, include_stack: bool) -> Value {
        let mut body = json!({
            "success": false,
            "error": self.public_name(),
            "code": self.code,
            "message": self.user_message,
            "timestamp": iso_timestamp(&self.timestamp),
        });

        if let Value::Object(map) = &mut body {
            if self.is_operational {
                map.insert("details".to_string(), Value::Object(self.context.clone()));
            }
            if include_stack {
                if let Some(stack) = &self.stack {
                    map.insert("stack".to_string(), Value::String(stack.clone()));
                }
            }
        }

        body
    }

    /// Wraps any foreign error into the generic application shape.
    ///
    /// An `AppError` passed in is returned unchanged.
    pub fn wrap<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(app_error) = (&error as &dyn Any).downcast_ref::<AppError>() {
            return app_error.clone();
        }

        let name = short_type_name::<E>();
        AppError::new(error.to_string())
            .name(name)
            .operational(false)
            .cause(error)
    }

    // -- HTTP 4xx client errors --

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        AppError::new(message)
            .name("BadRequestError")
            .status(400)
            .code("BAD_REQUEST")
            .user_message("Invalid request. Please check your input.")
            .severity(Severity::Low)
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        AppError::new(message)
            .name("UnauthorizedError")
            .status(401)
            .code("UNAUTHORIZED")
            .user_message("Please log in to continue.")
            .severity(Severity::Medium)
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        AppError::new(message)
            .name("ForbiddenError")
            .status(403)
            .code("FORBIDDEN")
            .user_message("You do not have permission to access this resource.")
            .severity(Severity::Medium)
    }

    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        let id = id.to_string();
        AppError::new(format!("{} with ID {} not found", resource, id))
            .name("NotFoundError")
            .status(404)
            .code("RESOURCE_NOT_FOUND")
            .user_message(format!("The requested {} was not found.", resource.to_lowercase()))
            .severity(Severity::Low)
            .context("resource", resource)
            .context("id", id)
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        AppError::new(message)
            .name("ConflictError")
            .status(409)
            .code("RESOURCE_CONFLICT")
            .user_message("This operation conflicts with existing data.")
            .severity(Severity::Medium)
    }

    pub fn validation<S: Into<String>>(message: S, validation_errors: Value) -> Self {
        AppError::new(message)
            .name("ValidationError")
            .status(400)
            .code("VALIDATION_FAILED")
            .user_message("Validation failed. Please check your input.")
            .severity(Severity::Low)
            .context("validationErrors", validation_errors)
    }

    pub fn rate_limit_exceeded(limit: u32, window: &str) -> Self {
        AppError::new(format!("Rate limit exceeded: {} requests per {}", limit, window))
            .name("RateLimitExceededError")
            .status(429)
            .code("RATE_LIMIT_EXCEEDED")
            .user_message("Too many requests. Please try again later.")
            .severity(Severity::Low)
            .context("limit", limit)
            .context("window", window)
    }

    // -- HTTP 5xx server errors --

    pub fn internal<S: Into<String>>(message: S) -> Self {
        AppError::new(message)
            .name("InternalServerError")
            .status(500)
            .code("INTERNAL_ERROR")
            .operational(false)
            .user_message("An unexpected error occurred. Please try again later.")
            .severity(Severity::Critical)
    }

    pub fn service_unavailable(service: &str) -> Self {
        AppError::new(format!("Service {} is currently unavailable", service))
            .name("ServiceUnavailableError")
            .status(503)
            .code("SERVICE_UNAVAILABLE")
            .user_message("Service temporarily unavailable. Please try again later.")
            .severity(Severity::High)
            .context("service", service)
    }

    // -- Database errors --

    pub fn database(operation: &str, table: &str, original: &str) -> Self {
        AppError::new(format!(
            "Database {} failed on table {}: {}",
            operation, table, original
        ))
        .name("DatabaseError")
        .status(500)
        .code("DATABASE_ERROR")
        .operational(false)
        .user_message("A database error occurred. Please try again.")
        .severity(Severity::Critical)
        .context("operation", operation)
        .context("table", table)
        .context("originalError", original)
    }

    pub fn database_connection(original: &str) -> Self {
        AppError::new(format!("Database connection failed: {}", original))
            .name("DatabaseConnectionError")
            .status(503)
            .code("DATABASE_CONNECTION_FAILED")
            .operational(false)
            .user_message("Database connection error. Please try again later.")
            .severity(Severity::Critical)
            .context("originalError", original)
    }

    pub fn database_constraint(constraint: &str, table: &str) -> Self {
        AppError::new(format!(
            "Database constraint violation: {} on table {}",
            constraint, table
        ))
        .name("DatabaseConstraintError")
        .status(409)
        .code("DATABASE_CONSTRAINT_VIOLATION")
        .user_message("This operation violates a data constraint.")
        .severity(Severity::Medium)
        .context("constraint", constraint)
        .context("table", table)
    }

    // -- Business errors --

    pub fn insufficient_stock(product_id: impl fmt::Display, requested: u32, available: u32) -> Self {
        let product_id = product_id.to_string();
        AppError::new(format!(
            "Insufficient stock for product {}: requested {}, available {}",
            product_id, requested, available
        ))
        .name("InsufficientStockError")
        .status(409)
        .code("INSUFFICIENT_STOCK")
        .user_message(format!("Only {} units available. Please adjust quantity.", available))
        .severity(Severity::Low)
        .context("productId", product_id)
        .context("requested", requested)
        .context("available", available)
    }

    pub fn payment_failed(reason: &str) -> Self {
        AppError::new(format!("Payment failed: {}", reason))
            .name("PaymentFailedError")
            .status(402)
            .code("PAYMENT_FAILED")
            .user_message("Payment failed. Please check your payment method.")
            .severity(Severity::High)
            .context("reason", reason)
    }

    pub fn order_not_processable(order_id: impl fmt::Display, reason: &str) -> Self {
        let order_id = order_id.to_string();
        AppError::new(format!("Order {} cannot be processed: {}", order_id, reason))
            .name("OrderNotProcessableError")
            .status(422)
            .code("ORDER_NOT_PROCESSABLE")
            .user_message(format!("Order cannot be processed: {}", reason))
            .severity(Severity::Medium)
            .context("orderId", order_id)
            .context("reason", reason)
    }

    pub fn invalid_state_transition(entity: &str, current: &str, target: &str) -> Self {
        AppError::new(format!(
            "Invalid state transition for {}: {} -> {}",
            entity, current, target
        ))
        .name("InvalidStateTransitionError")
        .status(409)
        .code("INVALID_STATE_TRANSITION")
        .user_message(format!("Cannot change {} from {} to {}.", entity, current, target))
        .severity(Severity::Medium)
        .context("entity", entity)
        .context("currentState", current)
        .context("targetState", target)
    }

    // -- External services --

    pub fn external_service(service: &str, operation: &str, original: &str) -> Self {
        AppError::new(format!(
            "External service {} failed during {}: {}",
            service, operation, original
        ))
        .name("ExternalServiceError")
        .status(502)
        .code("EXTERNAL_SERVICE_ERROR")
        .user_message("An external service is currently unavailable. Please try again later.")
        .severity(Severity::High)
        .context("service", service)
        .context("operation", operation)
        .context("originalError", original)
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppError")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("severity", &self.severity)
            .finish()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.name, self.code, self.message)
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::wrap(err).name("IoError")
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::wrap(err).name("SyntaxError").status(400).operational(true)
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AppError::new(format!("Operation timeout: {}", err))
            .name("TimeoutError")
            .status(504)
            .operational(false)
            .cause(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_error) => app_error,
            Err(err) => AppError::new(format!("{:#}", err))
                .name("Error")
                .operational(false),
        }
    }
}

/// RFC 3339 with millisecond precision, matching client expectations
pub fn iso_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

fn capture_stack(name: &str, message: &str) -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(format!("{}: {}\n{}", name, message, backtrace)),
        _ => Some(format!("{}: {}", name, message)),
    }
}

fn stack_with_header(name: &str, message: &str, stack: &str) -> String {
    // replace the first line, keep captured frames
    let frames = stack.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    if frames.is_empty() {
        format!("{}: {}", name, message)
    } else {
        format!("{}: {}\n{}", name, message, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::new("Invalid input format")
            .status(422)
            .code("VAL-001")
            .context("field", "username")
            .severity(Severity::Low);

        assert_eq!(err.name, "AppError");
        assert_eq!(err.message, "Invalid input format");
        assert_eq!(err.status_code, 422);
        assert_eq!(err.code, "VAL-001");
        assert_eq!(err.severity, Some(Severity::Low));
        assert_eq!(err.context.get("field"), Some(&json!("username")));
    }

    #[test]
    fn test_declared_severity_defaults_from_status() {
        assert_eq!(AppError::new("boom").declared_severity(), Severity::High);
        assert_eq!(AppError::new("meh").status(404).declared_severity(), Severity::Medium);
        assert_eq!(AppError::internal("x").declared_severity(), Severity::Critical);
    }

    #[test]
    fn test_to_json_shape() {
        let err = AppError::not_found("Product", 42);
        let body = err.to_json(false);

        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("NotFoundError"));
        assert_eq!(body["code"], json!("RESOURCE_NOT_FOUND"));
        assert_eq!(body["message"], json!("The requested product was not found."));
        assert_eq!(body["details"]["id"], json!("42"));
        assert!(body.get("stack").is_none());
        assert!(err.to_json(true).get("stack").is_some());
    }

    #[test]
    fn test_non_operational_errors_hide_details() {
        let body = AppError::database("SELECT", "orders", "deadlock").to_json(false);
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_validation_public_name() {
        let err = AppError::validation("bad payload", json!({"email": "required"}));
        assert_eq!(err.to_json(false)["error"], json!("validation"));
        assert_eq!(err.status_code, 400);
    }

    #[test]
    fn test_wrap_foreign_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk unplugged");
        let err = AppError::wrap(io);

        assert_eq!(err.name, "Error");
        assert_eq!(err.status_code, 500);
        assert!(!err.is_operational);
        assert!(err.message.contains("disk unplugged"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_wrap_keeps_app_errors() {
        let original = AppError::conflict("duplicate sku");
        let wrapped = AppError::wrap(original.clone());
        assert_eq!(wrapped.id, original.id);
        assert_eq!(wrapped.name, "ConflictError");
    }

    #[test]
    fn test_anyhow_round_trip() {
        let err: AppError = anyhow::Error::new(AppError::payment_failed("card declined")).into();
        assert_eq!(err.name, "PaymentFailedError");

        let err: AppError = anyhow::anyhow!("plain failure").into();
        assert_eq!(err.name, "Error");
        assert_eq!(err.status_code, 500);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert!(Severity::High.requires_recovery());
        assert!(!Severity::Medium.requires_recovery());
        assert_eq!(ErrorCategory::Database.default_severity(), Severity::High);
    }
}
