//! ExecutionStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::*;
use crate::definition::{DefinitionError, WorkflowDefinition};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Definition version not found
    #[error("workflow definition not found: {id} v{version}")]
    DefinitionNotFound { id: Uuid, version: i32 },

    /// Concurrency conflict (conditional write found a different state)
    #[error("concurrency conflict on execution {execution_id}")]
    ConcurrencyConflict { execution_id: Uuid },

    /// Requested status change is not an allowed edge
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Definition failed validation
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Another writer progressed the execution first
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Durable record of definitions, executions and step history
///
/// Every mutation of an execution goes through [`transition`](Self::transition),
/// a single-row conditional write keyed on the expected
/// `(status, current_step_id, current_attempt)`. There are no multi-row
/// transactions spanning executions.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Definition Operations
    // =========================================================================

    /// Validate and store a definition
    ///
    /// Storing an id that already exists creates the next version; stored
    /// versions are never modified.
    async fn put_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// Load an exact definition version
    async fn get_definition(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Latest active versions of a tenant's definitions triggered by `event_type`
    async fn active_definitions_for_event(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Latest active versions of all schedule-triggered definitions
    async fn scheduled_definitions(&self) -> Result<Vec<ScheduledDefinition>, StoreError>;

    /// Stop enrolling into a definition (all versions)
    ///
    /// In-flight executions are unaffected.
    async fn deactivate_definition(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record that `slot` fired for a scheduled definition
    ///
    /// Returns `false` if this or a later slot was already claimed.
    async fn claim_schedule_slot(
        &self,
        definition_id: Uuid,
        slot: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Enroll a subject, enforcing both idempotency guards atomically
    async fn create_execution(
        &self,
        execution: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError>;

    /// Load an execution
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Executions of a subject, newest first
    async fn executions_for_subject(
        &self,
        tenant_id: &str,
        subject_record_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Acquire the single active-attempt lease
    ///
    /// Succeeds only while the execution is `running` at `(step_id, attempt)`
    /// and no other worker holds an unexpired lease.
    async fn begin_attempt(
        &self,
        id: Uuid,
        step_id: &str,
        attempt: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Conditionally apply `update`, optionally appending `log` atomically
    ///
    /// Fails with [`StoreError::ConcurrencyConflict`] if the row no longer
    /// matches `expected`, and with [`StoreError::InvalidTransition`] if the
    /// status edge is not allowed.
    async fn transition(
        &self,
        id: Uuid,
        expected: &ExpectedState,
        update: ExecutionUpdate,
        log: Option<ExecutionLog>,
    ) -> Result<WorkflowExecution, StoreError>;

    /// Step history of an execution, oldest first
    async fn list_logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError>;

    /// Executions whose progress message may have been lost
    ///
    /// `running` rows untouched since `running_before` without a live lease
    /// (a pending retry's backoff counts as one) that were not dead-lettered,
    /// and `waiting` rows whose wake time passed before `wake_before`.
    async fn find_stalled(
        &self,
        running_before: DateTime<Utc>,
        wake_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    // =========================================================================
    // Retention Operations
    // =========================================================================

    /// Every tenant with stored data
    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Tenant override, if any
    async fn get_retention(&self, tenant_id: &str) -> Result<RetentionSettings, StoreError>;

    /// Set a tenant override
    async fn put_retention(
        &self,
        tenant_id: &str,
        settings: RetentionSettings,
    ) -> Result<(), StoreError>;

    /// Delete a tenant's log rows finished before `cutoff`
    async fn delete_logs_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Delete a tenant's terminal executions last updated before `cutoff`
    ///
    /// `running` and `waiting` executions are never deleted.
    async fn delete_terminal_executions_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
