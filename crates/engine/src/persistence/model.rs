//! Execution data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// A step is due or in progress
    Running,

    /// Parked at a wait step until its wake time
    Waiting,

    /// All steps finished
    Completed,

    /// Exhausted retries or hit a permanent error
    Failed,

    /// Cancelled by an operator or the embedding service
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal executions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed edge
    ///
    /// `running -> running` is a step advance; `waiting -> running` is a
    /// wake-up. Terminal statuses have no outgoing edges.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Running, Running | Waiting | Completed | Failed | Cancelled)
                | (Waiting, Running | Cancelled | Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Continuation state of a parked execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWake {
    /// The wait step that parked the execution
    pub wait_step_id: String,

    /// Attempt of the wait step that registered the timer
    pub wait_attempt: u32,

    pub wait_started_at: DateTime<Utc>,

    /// Never resume before this instant
    pub wake_at: DateTime<Utc>,

    /// Delay scheduler handle, for best-effort cancellation
    pub handle: Option<String>,
}

/// An enrollment of one subject record into one definition version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: String,
    pub definition_id: Uuid,
    pub definition_version: i32,
    pub subject_record_id: String,
    pub status: ExecutionStatus,

    /// Step due next; while `waiting` it is the step the timer resumes
    pub current_step_id: Option<String>,

    /// Attempt number (0-based) of `current_step_id`
    pub current_attempt: u32,

    /// Transient failures recorded over the whole execution
    pub failed_count: u32,

    /// `{"event": {..}, "steps": {..}}`
    pub context: Value,

    pub idempotency_key: String,
    pub last_error: Option<String>,
    pub pending_wake: Option<PendingWake>,

    /// Set while a worker holds the current attempt, or until a retry is due
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// The current attempt ran out of retries and went to the dead-letter queue
    pub dead_lettered_at: Option<DateTime<Utc>>,

    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to enroll a subject
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub tenant_id: String,
    pub definition_id: Uuid,
    pub definition_version: i32,
    pub subject_record_id: String,
    pub first_step_id: String,
    pub context: Value,
    pub idempotency_key: String,
}

impl NewExecution {
    /// Enrollment for `definition`'s root step
    ///
    /// Returns `None` for a definition without steps.
    pub fn for_definition(
        definition: &WorkflowDefinition,
        subject_record_id: impl Into<String>,
        context: Value,
        idempotency_key: impl Into<String>,
    ) -> Option<Self> {
        let first = definition.first_step()?;
        Some(Self {
            tenant_id: definition.tenant_id.clone(),
            definition_id: definition.id,
            definition_version: definition.version,
            subject_record_id: subject_record_id.into(),
            first_step_id: first.step_id.clone(),
            context,
            idempotency_key: idempotency_key.into(),
        })
    }

    /// Build the initial `running` row
    pub fn into_execution(self, now: DateTime<Utc>) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            tenant_id: self.tenant_id,
            definition_id: self.definition_id,
            definition_version: self.definition_version,
            subject_record_id: self.subject_record_id,
            status: ExecutionStatus::Running,
            current_step_id: Some(self.first_step_id),
            current_attempt: 0,
            failed_count: 0,
            context: self.context,
            idempotency_key: self.idempotency_key,
            last_error: None,
            pending_wake: None,
            lease_expires_at: None,
            dead_lettered_at: None,
            enrolled_at: now,
            updated_at: now,
        }
    }
}

/// Result of an enrollment attempt
#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    /// A new execution was created
    Enrolled(WorkflowExecution),

    /// Suppressed: same idempotency key, or a non-terminal execution for
    /// the same subject and definition already exists
    Duplicate { existing_id: Uuid },
}

/// The state a conditional write expects to find
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedState {
    pub status: ExecutionStatus,
    pub step_id: Option<String>,
    pub attempt: u32,
}

impl ExpectedState {
    /// Expect the execution exactly as it was loaded
    pub fn of(execution: &WorkflowExecution) -> Self {
        Self {
            status: execution.status,
            step_id: execution.current_step_id.clone(),
            attempt: execution.current_attempt,
        }
    }

    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.status == execution.status
            && self.step_id == execution.current_step_id
            && self.attempt == execution.current_attempt
    }
}

/// New values written by a conditional transition
///
/// Built from the loaded execution and then modified, so every column is
/// written explicitly.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub current_step_id: Option<String>,
    pub current_attempt: u32,
    pub failed_count: u32,
    pub context: Value,
    pub last_error: Option<String>,
    pub pending_wake: Option<PendingWake>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionUpdate {
    /// Start from the current row; the lease is released
    pub fn from_execution(execution: &WorkflowExecution, now: DateTime<Utc>) -> Self {
        Self {
            status: execution.status,
            current_step_id: execution.current_step_id.clone(),
            current_attempt: execution.current_attempt,
            failed_count: execution.failed_count,
            context: execution.context.clone(),
            last_error: execution.last_error.clone(),
            pending_wake: execution.pending_wake.clone(),
            lease_expires_at: None,
            dead_lettered_at: execution.dead_lettered_at,
            updated_at: now,
        }
    }

    /// Move to `step_id` attempt 0, still running
    pub fn advance_to(mut self, step_id: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Running;
        self.current_step_id = Some(step_id.into());
        self.current_attempt = 0;
        self.pending_wake = None;
        self.dead_lettered_at = None;
        self
    }

    /// Park at a wait step; `next_step_id` is what the timer resumes
    pub fn park(mut self, next_step_id: impl Into<String>, wake: PendingWake) -> Self {
        self.status = ExecutionStatus::Waiting;
        self.current_step_id = Some(next_step_id.into());
        self.current_attempt = 0;
        self.pending_wake = Some(wake);
        self.dead_lettered_at = None;
        self
    }

    /// Record a transient failure and move to the next attempt of the same step
    ///
    /// The next attempt stays leased until `due_at`, so nothing can start it
    /// before its backoff has elapsed.
    pub fn retry(mut self, error: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        self.current_attempt += 1;
        self.failed_count += 1;
        self.last_error = Some(error.into());
        self.lease_expires_at = Some(due_at);
        self
    }

    /// Keep the current attempt but mark it handed to the dead-letter queue
    pub fn dead_letter(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self.dead_lettered_at = Some(self.updated_at);
        self
    }

    /// Merge a step's output into `context.steps.<step_id>`; null outputs are skipped
    pub fn with_step_output(mut self, step_id: &str, output: Value) -> Self {
        if output.is_null() {
            return self;
        }
        if !self.context.is_object() {
            self.context = json!({});
        }
        if let Some(context) = self.context.as_object_mut() {
            let steps = context.entry("steps").or_insert_with(|| json!({}));
            if !steps.is_object() {
                *steps = json!({});
            }
            if let Some(steps) = steps.as_object_mut() {
                steps.insert(step_id.to_string(), output);
            }
        }
        self
    }

    /// Finish successfully
    pub fn complete(mut self) -> Self {
        self.status = ExecutionStatus::Completed;
        self.current_step_id = None;
        self.pending_wake = None;
        self
    }

    /// Finish with `status` (failed or cancelled), keeping the step for diagnostics
    pub fn finish(mut self, status: ExecutionStatus, error: impl Into<String>) -> Self {
        self.status = status;
        self.last_error = Some(error.into());
        self.pending_wake = None;
        self
    }

    /// Apply the update to a row
    pub fn apply(self, execution: &mut WorkflowExecution) {
        execution.status = self.status;
        execution.current_step_id = self.current_step_id;
        execution.current_attempt = self.current_attempt;
        execution.failed_count = self.failed_count;
        execution.context = self.context;
        execution.last_error = self.last_error;
        execution.pending_wake = self.pending_wake;
        execution.lease_expires_at = self.lease_expires_at;
        execution.dead_lettered_at = self.dead_lettered_at;
        execution.updated_at = self.updated_at;
    }
}

/// Outcome of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    Retried,
    Failed,
    Cancelled,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "retried" => Some(Self::Retried),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row for one step attempt
///
/// `(execution_id, step_id, attempt)` is unique; writing the same key
/// twice keeps the first row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: LogOutcome,
    pub error_detail: Option<String>,
}

impl ExecutionLog {
    /// Row for an attempt of `step_id` on `execution`
    pub fn new(
        execution: &WorkflowExecution,
        step_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: LogOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            tenant_id: execution.tenant_id.clone(),
            step_id: step_id.into(),
            attempt,
            started_at,
            finished_at,
            outcome,
            error_detail: None,
        }
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// Per-tenant retention override; `None` falls back to the engine default
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionSettings {
    pub log_retention_days: Option<u32>,
    pub execution_retention_days: Option<u32>,
}

impl RetentionSettings {
    /// `(log_days, execution_days)` after applying defaults
    pub fn resolve(&self, config: &EngineConfig) -> (u32, u32) {
        (
            self.log_retention_days
                .unwrap_or(config.default_log_retention_days),
            self.execution_retention_days
                .unwrap_or(config.default_execution_retention_days),
        )
    }
}

/// A scheduled definition together with the last slot it fired for
#[derive(Debug, Clone)]
pub struct ScheduledDefinition {
    pub definition: WorkflowDefinition,
    pub last_slot: Option<DateTime<Utc>>,
}

/// Initial execution context for a trigger
pub fn initial_context(event_type: &str, payload: &Value, occurred_at: DateTime<Utc>) -> Value {
    json!({
        "event": {
            "type": event_type,
            "payload": payload,
            "occurred_at": occurred_at.to_rfc3339(),
        },
        "steps": {},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_edges() {
        use ExecutionStatus::*;

        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Running.can_transition_to(Completed));
        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Cancelled));

        assert!(!Waiting.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Waiting,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("pending"), None);
    }

    #[test]
    fn test_update_advance_resets_attempt() {
        let now = Utc::now();
        let mut execution = NewExecution {
            tenant_id: "t".into(),
            definition_id: Uuid::now_v7(),
            definition_version: 1,
            subject_record_id: "s".into(),
            first_step_id: "a".into(),
            context: json!({}),
            idempotency_key: "k".into(),
        }
        .into_execution(now);
        execution.current_attempt = 2;

        let update = ExecutionUpdate::from_execution(&execution, now).advance_to("b");
        update.apply(&mut execution);

        assert_eq!(execution.current_step_id.as_deref(), Some("b"));
        assert_eq!(execution.current_attempt, 0);
        assert_eq!(execution.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_step_output_is_merged_under_steps() {
        let now = Utc::now();
        let execution = NewExecution {
            tenant_id: "t".into(),
            definition_id: Uuid::now_v7(),
            definition_version: 1,
            subject_record_id: "s".into(),
            first_step_id: "a".into(),
            context: initial_context("x", &json!({}), now),
            idempotency_key: "k".into(),
        }
        .into_execution(now);

        let update = ExecutionUpdate::from_execution(&execution, now)
            .with_step_output("a", json!({"sent": true}))
            .with_step_output("b", Value::Null);

        assert_eq!(update.context["steps"]["a"]["sent"], true);
        assert!(update.context["steps"].get("b").is_none());
        assert_eq!(update.context["event"]["type"], "x");
    }

    #[test]
    fn test_retry_bumps_attempt_and_failed_count() {
        let now = Utc::now();
        let execution = NewExecution {
            tenant_id: "t".into(),
            definition_id: Uuid::now_v7(),
            definition_version: 1,
            subject_record_id: "s".into(),
            first_step_id: "a".into(),
            context: json!({}),
            idempotency_key: "k".into(),
        }
        .into_execution(now);

        let due_at = now + chrono::Duration::minutes(5);
        let update = ExecutionUpdate::from_execution(&execution, now).retry("timeout", due_at);
        assert_eq!(update.current_attempt, 1);
        assert_eq!(update.failed_count, 1);
        assert_eq!(update.last_error.as_deref(), Some("timeout"));
        assert_eq!(update.status, ExecutionStatus::Running);
        assert_eq!(update.lease_expires_at, Some(due_at));
    }

    #[test]
    fn test_retention_defaults() {
        let config = EngineConfig::default();
        assert_eq!(RetentionSettings::default().resolve(&config), (90, 180));

        let custom = RetentionSettings {
            log_retention_days: Some(30),
            execution_retention_days: None,
        };
        assert_eq!(custom.resolve(&config), (30, 180));
    }

    #[test]
    fn test_initial_context_shape() {
        let occurred_at = Utc::now();
        let ctx = initial_context("booking.created", &json!({"id": 1}), occurred_at);
        assert_eq!(ctx["event"]["type"], "booking.created");
        assert_eq!(ctx["event"]["payload"]["id"], 1);
        assert!(ctx["steps"].as_object().unwrap().is_empty());
    }
}
