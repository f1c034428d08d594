//! # Request Context
//!
//! The slice of the incoming request the engine needs: where the failure
//! happened, who triggered it, and optionally how to re-run the failed work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::types::AppError;

/// Re-runs the operation whose failure is being handled
pub type RetryOperation =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, AppError>> + Send + Sync>;

/// Request metadata handed to the engine alongside the error
#[derive(Clone)]
pub struct RequestContext {
    /// HTTP method (GET, POST, ...)
    pub method: String,
    /// Request path without query string
    pub path: String,
    /// Request id echoed back in responses
    pub request_id: String,
    /// Authenticated user, if any
    pub user_id: Option<String>,
    /// Operation to replay during recovery
    pub retry: Option<RetryOperation>,
}

impl RequestContext {
    /// Creates a context for the given method and path with a fresh request id
    pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
            request_id: Uuid::new_v4().to_string(),
            user_id: None,
            retry: None,
        }
    }

    /// Sets the request id
    pub fn request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the authenticated user
    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches an operation recovery strategies may re-run
    pub fn with_retry<F, Fut>(mut self, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, AppError>> + Send + 'static,
    {
        self.retry = Some(Arc::new(move || operation().boxed()));
        self
    }

    /// `"METHOD path"`, the unit metrics and circuit breakers are keyed by
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// User id or the literal `anonymous`
    pub fn actor(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("request_id", &self.request_id)
            .field("user_id", &self.user_id)
            .field("retry", &self.retry.is_some())
            .finish()
    }
}
