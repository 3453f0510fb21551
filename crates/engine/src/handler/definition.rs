//! Step handler trait definition

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::HandlerInvocation;

/// Error type for handler failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the execution immediately
    /// without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl HandlerError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Text recorded in the execution log
    pub fn detail(&self) -> String {
        match &self.error_type {
            Some(t) => format!("{t}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A named external collaborator invoked by action steps
///
/// The engine knows nothing about what a handler does (send an email,
/// mutate a booking). It only relies on the result: `Ok` advances the
/// execution, a retryable error feeds the backoff path, a permanent
/// error fails the execution.
///
/// Handlers may be invoked more than once for the same step (at-least-once
/// delivery), so they should be idempotent on
/// `(execution_id, step_id, attempt)` where that matters.
///
/// # Example
///
/// ```ignore
/// struct SendEmail { mailer: Mailer }
///
/// #[async_trait]
/// impl StepHandler for SendEmail {
///     async fn handle(&self, inv: &HandlerInvocation) -> Result<Value, HandlerError> {
///         self.mailer
///             .send(&inv.subject_record_id, inv.param_str("template").unwrap_or("default"))
///             .await
///             .map_err(|e| HandlerError::retryable(e.to_string()))?;
///         Ok(json!({ "sent": true }))
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Run the handler
    ///
    /// The returned value (unless `null`) is stored in the execution context
    /// under `steps.<step_id>` for later steps to read.
    async fn handle(&self, invocation: &HandlerInvocation) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`StepHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, invocation: &HandlerInvocation) -> Result<Value, HandlerError> {
        (self.f)(invocation.clone()).await
    }
}
