//! Handler invocation context

use serde_json::Value;
use uuid::Uuid;

/// Everything an action handler is told about the attempt it serves
///
/// Handlers receive the tenant, the enrolled subject, the step's static
/// parameters and the execution's accumulated context. They never see or
/// mutate execution state directly.
///
/// # Example
///
/// ```ignore
/// async fn handle(&self, inv: &HandlerInvocation) -> Result<Value, HandlerError> {
///     let template = inv.param_str("template").unwrap_or("default");
///     let booking = &inv.context["event"]["payload"];
///
///     mailer.send(&inv.tenant_id, &inv.subject_record_id, template, booking).await?;
///     Ok(json!({ "sent": true }))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    /// Tenant that owns the execution
    pub tenant_id: String,

    /// Enrolled entity, e.g. a booking or pet id
    pub subject_record_id: String,

    /// Execution this attempt belongs to
    pub execution_id: Uuid,

    /// Step within the definition
    pub step_id: String,

    /// Current attempt number (0-based)
    pub attempt: u32,

    /// Maximum attempts allowed for this step
    pub max_attempts: u32,

    /// Static step parameters from the definition
    pub params: Value,

    /// Accumulated execution context (`event` and prior `steps` outputs)
    pub context: Value,
}

impl HandlerInvocation {
    /// Create an invocation for the first attempt
    pub fn new(
        tenant_id: impl Into<String>,
        subject_record_id: impl Into<String>,
        execution_id: Uuid,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subject_record_id: subject_record_id.into(),
            execution_id,
            step_id: step_id.into(),
            attempt: 0,
            max_attempts: 1,
            params: Value::Null,
            context: Value::Null,
        }
    }

    /// Set attempt counters
    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    /// Set step parameters
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Set execution context
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}
