//! PostgreSQL implementation of ExecutionStore
//!
//! Production-ready persistence using PostgreSQL with:
//! - Conditional single-row updates for every execution transition
//! - Unique constraints as the enrollment idempotency guards
//! - Append-only step logs deduplicated on `(execution_id, step_id, attempt)`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::model::*;
use super::store::*;
use crate::definition::{TriggerSpec, WorkflowDefinition};

const EXECUTION_COLUMNS: &str = r#"
    id, tenant_id, definition_id, definition_version, subject_record_id, status,
    current_step_id, current_attempt, failed_count, context, idempotency_key,
    last_error, pending_wake, lease_expires_at, dead_lettered_at, enrolled_at, updated_at
"#;

/// PostgreSQL implementation of ExecutionStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use tenantflow_engine::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresExecutionStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the engine's schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        info!("workflow engine migrations applied");
        Ok(())
    }

    async fn find_enrollment_conflict(
        &self,
        execution: &NewExecution,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM workflow_executions
            WHERE idempotency_key = $1
               OR (tenant_id = $2 AND definition_id = $3 AND subject_record_id = $4
                   AND status IN ('running', 'waiting'))
            LIMIT 1
            "#,
        )
        .bind(&execution.idempotency_key)
        .bind(&execution.tenant_id)
        .bind(execution.definition_id)
        .bind(&execution.subject_record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to look up existing enrollment: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(|r| r.get("id")))
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    async fn put_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        definition.validate()?;

        let (trigger_kind, event_type) = match &definition.trigger {
            TriggerSpec::Event { event_type, .. } => ("event", Some(event_type.clone())),
            TriggerSpec::Schedule { .. } => ("schedule", None),
        };
        let body = serde_json::to_value(&definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_definitions
                (id, version, tenant_id, name, trigger_kind, event_type, definition, is_active, created_at)
            SELECT $1, COALESCE(MAX(version), 0) + 1, $2, $3, $4, $5, $6, $7, $8
            FROM workflow_definitions
            WHERE id = $1
            RETURNING version
            "#,
        )
        .bind(definition.id)
        .bind(&definition.tenant_id)
        .bind(&definition.name)
        .bind(trigger_kind)
        .bind(&event_type)
        .bind(&body)
        .bind(definition.is_active)
        .bind(definition.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store workflow definition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        definition.version = row.get("version");
        debug!(id = %definition.id, version = definition.version, "stored workflow definition");
        Ok(definition)
    }

    #[instrument(skip(self))]
    async fn get_definition(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT version, definition, is_active
            FROM workflow_definitions
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow definition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(definition_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn active_definitions_for_event(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT version, definition, is_active FROM (
                SELECT DISTINCT ON (id) id, version, definition, is_active, trigger_kind, event_type
                FROM workflow_definitions
                WHERE tenant_id = $1
                ORDER BY id, version DESC
            ) latest
            WHERE is_active AND trigger_kind = 'event' AND event_type = $2
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list definitions for event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(definition_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn scheduled_definitions(&self) -> Result<Vec<ScheduledDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT latest.version, latest.definition, latest.is_active, s.last_slot
            FROM (
                SELECT DISTINCT ON (id) id, version, definition, is_active, trigger_kind
                FROM workflow_definitions
                ORDER BY id, version DESC
            ) latest
            LEFT JOIN workflow_schedule_slots s ON s.definition_id = latest.id
            WHERE latest.is_active AND latest.trigger_kind = 'schedule'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list scheduled definitions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter()
            .map(|row| {
                Ok(ScheduledDefinition {
                    definition: definition_from_row(row)?,
                    last_slot: row.get("last_slot"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn deactivate_definition(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_definitions SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to deactivate definition: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%id, "deactivated workflow definition");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_schedule_slot(
        &self,
        definition_id: Uuid,
        slot: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_schedule_slots (definition_id, last_slot)
            VALUES ($1, $2)
            ON CONFLICT (definition_id) DO UPDATE
                SET last_slot = EXCLUDED.last_slot
                WHERE workflow_schedule_slots.last_slot < EXCLUDED.last_slot
            "#,
        )
        .bind(definition_id)
        .bind(slot)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim schedule slot: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, execution), fields(tenant_id = %execution.tenant_id, subject = %execution.subject_record_id))]
    async fn create_execution(
        &self,
        execution: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError> {
        // An active execution may finish between the failed insert and the
        // lookup; one more insert attempt settles it.
        for _ in 0..2 {
            let row = execution.clone().into_execution(now);
            let inserted = sqlx::query(
                r#"
                INSERT INTO workflow_executions
                    (id, tenant_id, definition_id, definition_version, subject_record_id, status,
                     current_step_id, current_attempt, failed_count, context, idempotency_key,
                     enrolled_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, 'running', $6, 0, 0, $7, $8, $9, $9)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(&row.tenant_id)
            .bind(row.definition_id)
            .bind(row.definition_version)
            .bind(&row.subject_record_id)
            .bind(&row.current_step_id)
            .bind(&row.context)
            .bind(&row.idempotency_key)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to create execution: {}", e);
                StoreError::Database(e.to_string())
            })?;

            if inserted.rows_affected() == 1 {
                debug!(execution_id = %row.id, "created execution");
                return Ok(EnrollOutcome::Enrolled(row));
            }

            if let Some(existing_id) = self.find_enrollment_conflict(&execution).await? {
                return Ok(EnrollOutcome::Duplicate { existing_id });
            }
        }

        Err(StoreError::Database(
            "enrollment conflicted but no existing execution was found".to_string(),
        ))
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get execution: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn executions_for_subject(
        &self,
        tenant_id: &str,
        subject_record_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE tenant_id = $1 AND subject_record_id = $2 \
             ORDER BY enrolled_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(subject_record_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list executions for subject: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn begin_attempt(
        &self,
        id: Uuid,
        step_id: &str,
        attempt: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lease_expires_at = $4
            WHERE id = $1
              AND status = 'running'
              AND current_step_id = $2
              AND current_attempt = $3
              AND (lease_expires_at IS NULL OR lease_expires_at <= $5)
            "#,
        )
        .bind(id)
        .bind(step_id)
        .bind(attempt as i32)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to begin attempt: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, expected, update, log), fields(to = %update.status))]
    async fn transition(
        &self,
        id: Uuid,
        expected: &ExpectedState,
        update: ExecutionUpdate,
        log: Option<ExecutionLog>,
    ) -> Result<WorkflowExecution, StoreError> {
        if !expected.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                from: expected.status,
                to: update.status,
            });
        }

        let pending_wake = update
            .pending_wake
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let wake_at = update.pending_wake.as_ref().map(|w| w.wake_at);

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let sql = format!(
            r#"
            UPDATE workflow_executions
            SET status = $5,
                current_step_id = $6,
                current_attempt = $7,
                failed_count = $8,
                context = $9,
                last_error = $10,
                pending_wake = $11,
                wake_at = $12,
                lease_expires_at = $13,
                dead_lettered_at = $15,
                updated_at = $14
            WHERE id = $1
              AND status = $2
              AND current_step_id IS NOT DISTINCT FROM $3
              AND current_attempt = $4
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected.status.as_str())
            .bind(&expected.step_id)
            .bind(expected.attempt as i32)
            .bind(update.status.as_str())
            .bind(&update.current_step_id)
            .bind(update.current_attempt as i32)
            .bind(update.failed_count as i32)
            .bind(&update.context)
            .bind(&update.last_error)
            .bind(&pending_wake)
            .bind(wake_at)
            .bind(update.lease_expires_at)
            .bind(update.updated_at)
            .bind(update.dead_lettered_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to transition execution: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let Some(row) = row else {
            let exists = sqlx::query("SELECT 1 FROM workflow_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?
                .is_some();

            return Err(if exists {
                StoreError::ConcurrencyConflict { execution_id: id }
            } else {
                StoreError::ExecutionNotFound(id)
            });
        };

        if let Some(log) = &log {
            sqlx::query(
                r#"
                INSERT INTO workflow_execution_logs
                    (id, execution_id, tenant_id, step_id, attempt, started_at, finished_at, outcome, error_detail)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (execution_id, step_id, attempt) DO NOTHING
                "#,
            )
            .bind(log.id)
            .bind(log.execution_id)
            .bind(&log.tenant_id)
            .bind(&log.step_id)
            .bind(log.attempt as i32)
            .bind(log.started_at)
            .bind(log.finished_at)
            .bind(log.outcome.as_str())
            .bind(&log.error_detail)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to append execution log: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let execution = execution_from_row(&row)?;
        debug!(execution_id = %id, status = %execution.status, step = ?execution.current_step_id, "transitioned execution");
        Ok(execution)
    }

    #[instrument(skip(self))]
    async fn list_logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, tenant_id, step_id, attempt, started_at, finished_at,
                   outcome, error_detail
            FROM workflow_execution_logs
            WHERE execution_id = $1
            ORDER BY finished_at, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list execution logs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter()
            .map(|row| {
                let outcome: String = row.get("outcome");
                Ok(ExecutionLog {
                    id: row.get("id"),
                    execution_id: row.get("execution_id"),
                    tenant_id: row.get("tenant_id"),
                    step_id: row.get("step_id"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                    started_at: row.get("started_at"),
                    finished_at: row.get("finished_at"),
                    outcome: LogOutcome::parse(&outcome).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown log outcome: {outcome}"))
                    })?,
                    error_detail: row.get("error_detail"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_stalled(
        &self,
        running_before: DateTime<Utc>,
        wake_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM workflow_executions
            WHERE (status = 'running' AND updated_at < $1
                   AND dead_lettered_at IS NULL
                   AND (lease_expires_at IS NULL OR lease_expires_at <= $3))
               OR (status = 'waiting' AND wake_at < $2)
            ORDER BY updated_at
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(running_before)
            .bind(wake_before)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find stalled executions: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id FROM workflow_executions
            UNION
            SELECT tenant_id FROM workflow_execution_logs
            UNION
            SELECT tenant_id FROM tenant_retention_settings
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list tenants: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("tenant_id")).collect())
    }

    #[instrument(skip(self))]
    async fn get_retention(&self, tenant_id: &str) -> Result<RetentionSettings, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_log_retention_days, workflow_execution_retention_days
            FROM tenant_retention_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get retention settings: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row
            .map(|r| RetentionSettings {
                log_retention_days: r
                    .get::<Option<i32>, _>("workflow_log_retention_days")
                    .map(|d| d.max(0) as u32),
                execution_retention_days: r
                    .get::<Option<i32>, _>("workflow_execution_retention_days")
                    .map(|d| d.max(0) as u32),
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn put_retention(
        &self,
        tenant_id: &str,
        settings: RetentionSettings,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_retention_settings
                (tenant_id, workflow_log_retention_days, workflow_execution_retention_days, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id) DO UPDATE
                SET workflow_log_retention_days = EXCLUDED.workflow_log_retention_days,
                    workflow_execution_retention_days = EXCLUDED.workflow_execution_retention_days,
                    updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(settings.log_retention_days.map(|d| d as i32))
        .bind(settings.execution_retention_days.map(|d| d as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to put retention settings: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_logs_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM workflow_execution_logs WHERE tenant_id = $1 AND finished_at < $2",
        )
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete execution logs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_terminal_executions_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_executions
            WHERE tenant_id = $1
              AND status IN ('completed', 'failed', 'cancelled')
              AND updated_at < $2
            "#,
        )
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete terminal executions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }
}

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    let body: serde_json::Value = row.get("definition");
    let mut definition: WorkflowDefinition =
        serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))?;
    definition.version = row.get("version");
    definition.is_active = row.get("is_active");
    Ok(definition)
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    let pending_wake: Option<serde_json::Value> = row.get("pending_wake");

    Ok(WorkflowExecution {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        definition_id: row.get("definition_id"),
        definition_version: row.get("definition_version"),
        subject_record_id: row.get("subject_record_id"),
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown status: {status}")))?,
        current_step_id: row.get("current_step_id"),
        current_attempt: row.get::<i32, _>("current_attempt") as u32,
        failed_count: row.get::<i32, _>("failed_count") as u32,
        context: row.get("context"),
        idempotency_key: row.get("idempotency_key"),
        last_error: row.get("last_error"),
        pending_wake: pending_wake
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        lease_expires_at: row.get("lease_expires_at"),
        dead_lettered_at: row.get("dead_lettered_at"),
        enrolled_at: row.get("enrolled_at"),
        updated_at: row.get("updated_at"),
    })
}
