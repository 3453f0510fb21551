//! In-memory implementation of ExecutionStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::model::*;
use super::store::*;
use crate::definition::{TriggerSpec, WorkflowDefinition};

/// Execution rows plus the idempotency-key index, guarded together so
/// enrollment checks and inserts are atomic
#[derive(Default)]
struct ExecutionTable {
    rows: HashMap<Uuid, WorkflowExecution>,
    by_key: HashMap<String, Uuid>,
}

/// In-memory implementation of ExecutionStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use tenantflow_engine::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryExecutionStore {
    definitions: RwLock<HashMap<Uuid, Vec<WorkflowDefinition>>>,
    schedule_slots: RwLock<HashMap<Uuid, DateTime<Utc>>>,
    executions: RwLock<ExecutionTable>,
    logs: RwLock<Vec<ExecutionLog>>,
    retention: RwLock<HashMap<String, RetentionSettings>>,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            schedule_slots: RwLock::new(HashMap::new()),
            executions: RwLock::new(ExecutionTable::default()),
            logs: RwLock::new(Vec::new()),
            retention: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of executions
    pub fn execution_count(&self) -> usize {
        self.executions.read().rows.len()
    }

    /// Get the number of log rows
    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }

    /// Overwrite an execution's `updated_at` (for retention tests)
    pub fn backdate_execution(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(row) = self.executions.write().rows.get_mut(&id) {
            row.updated_at = updated_at;
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.definitions.write().clear();
        self.schedule_slots.write().clear();
        *self.executions.write() = ExecutionTable::default();
        self.logs.write().clear();
        self.retention.write().clear();
    }

    fn latest_active<'a>(
        versions: impl Iterator<Item = &'a Vec<WorkflowDefinition>>,
    ) -> impl Iterator<Item = &'a WorkflowDefinition> {
        versions.filter_map(|v| v.last()).filter(|d| d.is_active)
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn put_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        definition.validate()?;

        let mut definitions = self.definitions.write();
        let versions = definitions.entry(definition.id).or_default();
        definition.version = versions.last().map_or(1, |d| d.version + 1);
        versions.push(definition.clone());

        Ok(definition)
    }

    async fn get_definition(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .get(&id)
            .and_then(|versions| versions.iter().find(|d| d.version == version))
            .cloned())
    }

    async fn active_definitions_for_event(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let definitions = self.definitions.read();
        Ok(Self::latest_active(definitions.values())
            .filter(|d| d.tenant_id == tenant_id)
            .filter(|d| {
                matches!(&d.trigger, TriggerSpec::Event { event_type: t, .. } if t == event_type)
            })
            .cloned()
            .collect())
    }

    async fn scheduled_definitions(&self) -> Result<Vec<ScheduledDefinition>, StoreError> {
        let definitions = self.definitions.read();
        let slots = self.schedule_slots.read();
        Ok(Self::latest_active(definitions.values())
            .filter(|d| matches!(d.trigger, TriggerSpec::Schedule { .. }))
            .map(|d| ScheduledDefinition {
                definition: d.clone(),
                last_slot: slots.get(&d.id).copied(),
            })
            .collect())
    }

    async fn deactivate_definition(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(versions) = self.definitions.write().get_mut(&id) {
            for version in versions.iter_mut() {
                version.is_active = false;
            }
        }
        Ok(())
    }

    async fn claim_schedule_slot(
        &self,
        definition_id: Uuid,
        slot: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut slots = self.schedule_slots.write();
        match slots.get(&definition_id) {
            Some(last) if *last >= slot => Ok(false),
            _ => {
                slots.insert(definition_id, slot);
                Ok(true)
            }
        }
    }

    async fn create_execution(
        &self,
        execution: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError> {
        let mut table = self.executions.write();

        if let Some(existing_id) = table.by_key.get(&execution.idempotency_key) {
            return Ok(EnrollOutcome::Duplicate {
                existing_id: *existing_id,
            });
        }

        let active = table.rows.values().find(|e| {
            e.tenant_id == execution.tenant_id
                && e.definition_id == execution.definition_id
                && e.subject_record_id == execution.subject_record_id
                && !e.status.is_terminal()
        });
        if let Some(existing) = active {
            return Ok(EnrollOutcome::Duplicate {
                existing_id: existing.id,
            });
        }

        let row = execution.into_execution(now);
        table.by_key.insert(row.idempotency_key.clone(), row.id);
        table.rows.insert(row.id, row.clone());

        Ok(EnrollOutcome::Enrolled(row))
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().rows.get(&id).cloned())
    }

    async fn executions_for_subject(
        &self,
        tenant_id: &str,
        subject_record_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let table = self.executions.read();
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.subject_record_id == subject_record_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn begin_attempt(
        &self,
        id: Uuid,
        step_id: &str,
        attempt: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut table = self.executions.write();
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(false);
        };

        let available = row.status == ExecutionStatus::Running
            && row.current_step_id.as_deref() == Some(step_id)
            && row.current_attempt == attempt
            && row.lease_expires_at.map_or(true, |lease| lease <= now);

        if available {
            row.lease_expires_at = Some(lease_until);
        }
        Ok(available)
    }

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

        let mut table = self.executions.write();
        let row = table
            .rows
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !expected.matches(row) {
            return Err(StoreError::ConcurrencyConflict { execution_id: id });
        }

        update.apply(row);
        let updated = row.clone();

        if let Some(log) = log {
            let mut logs = self.logs.write();
            let duplicate = logs.iter().any(|l| {
                l.execution_id == log.execution_id
                    && l.step_id == log.step_id
                    && l.attempt == log.attempt
            });
            if !duplicate {
                logs.push(log);
            }
        }

        Ok(updated)
    }

    async fn list_logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, StoreError> {
        let mut logs: Vec<_> = self
            .logs
            .read()
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.finished_at.cmp(&b.finished_at).then(a.id.cmp(&b.id)));
        Ok(logs)
    }

    async fn find_stalled(
        &self,
        running_before: DateTime<Utc>,
        wake_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let table = self.executions.read();
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|e| match e.status {
                ExecutionStatus::Running => {
                    e.updated_at < running_before
                        && e.dead_lettered_at.is_none()
                        && e.lease_expires_at.map_or(true, |lease| lease <= now)
                }
                ExecutionStatus::Waiting => e
                    .pending_wake
                    .as_ref()
                    .is_some_and(|w| w.wake_at < wake_before),
                _ => false,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut tenants: Vec<String> = self
            .executions
            .read()
            .rows
            .values()
            .map(|e| e.tenant_id.clone())
            .chain(self.logs.read().iter().map(|l| l.tenant_id.clone()))
            .chain(self.retention.read().keys().cloned())
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    async fn get_retention(&self, tenant_id: &str) -> Result<RetentionSettings, StoreError> {
        Ok(self
            .retention
            .read()
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_retention(
        &self,
        tenant_id: &str,
        settings: RetentionSettings,
    ) -> Result<(), StoreError> {
        self.retention
            .write()
            .insert(tenant_id.to_string(), settings);
        Ok(())
    }

    async fn delete_logs_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut logs = self.logs.write();
        let before = logs.len();
        logs.retain(|l| !(l.tenant_id == tenant_id && l.finished_at < cutoff));
        Ok((before - logs.len()) as u64)
    }

    async fn delete_terminal_executions_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut table = self.executions.write();
        let doomed: Vec<(Uuid, String)> = table
            .rows
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.status.is_terminal() && e.updated_at < cutoff)
            .map(|e| (e.id, e.idempotency_key.clone()))
            .collect();

        for (id, key) in &doomed {
            table.rows.remove(id);
            table.by_key.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Predicate, StepDefinition, WaitSpec};
    use chrono::Duration;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "tenant-a",
            "reminder",
            TriggerSpec::Event {
                event_type: "booking.created".into(),
                filter: None,
            },
            vec![
                StepDefinition::action("confirm", "send", json!({})).then("pause"),
                StepDefinition::wait("pause", WaitSpec::For { duration_ms: 1000 }).then("remind"),
                StepDefinition::action("remind", "send", json!({})),
            ],
        )
    }

    fn enrollment(def: &WorkflowDefinition, subject: &str, key: &str) -> NewExecution {
        NewExecution::for_definition(def, subject, json!({}), key).unwrap()
    }

    #[tokio::test]
    async fn test_put_definition_creates_versions() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        assert_eq!(def.version, 1);

        let mut edited = def.clone();
        edited.name = "reminder v2".into();
        let edited = store.put_definition(edited).await.unwrap();
        assert_eq!(edited.version, 2);

        let v1 = store.get_definition(def.id, 1).await.unwrap().unwrap();
        assert_eq!(v1.name, "reminder");

        let active = store
            .active_definitions_for_event("tenant-a", "booking.created")
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 2);
    }

    #[tokio::test]
    async fn test_put_definition_rejects_invalid() {
        let store = InMemoryExecutionStore::new();
        let mut def = definition();
        def.steps.clear();

        let result = store.put_definition(def).await;
        assert!(matches!(result, Err(StoreError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn test_deactivated_definitions_are_not_matched() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        store.deactivate_definition(def.id).await.unwrap();

        let active = store
            .active_definitions_for_event("tenant-a", "booking.created")
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_enrollment_guards() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        let now = Utc::now();

        let first = match store
            .create_execution(enrollment(&def, "booking-1", "k1"), now)
            .await
            .unwrap()
        {
            EnrollOutcome::Enrolled(e) => e,
            other => panic!("expected enrollment, got {other:?}"),
        };
        assert_eq!(first.status, ExecutionStatus::Running);
        assert_eq!(first.current_step_id.as_deref(), Some("confirm"));

        // Same key
        let dup = store
            .create_execution(enrollment(&def, "booking-1", "k1"), now)
            .await
            .unwrap();
        assert!(matches!(dup, EnrollOutcome::Duplicate { existing_id } if existing_id == first.id));

        // Different key, same subject still running
        let dup = store
            .create_execution(enrollment(&def, "booking-1", "k2"), now)
            .await
            .unwrap();
        assert!(matches!(dup, EnrollOutcome::Duplicate { .. }));

        // Different subject
        let other = store
            .create_execution(enrollment(&def, "booking-2", "k3"), now)
            .await
            .unwrap();
        assert!(matches!(other, EnrollOutcome::Enrolled(_)));
        assert_eq!(store.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_transition_conflict_and_invalid_edge() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        let now = Utc::now();
        let EnrollOutcome::Enrolled(exec) = store
            .create_execution(enrollment(&def, "b", "k"), now)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };

        let expected = ExpectedState::of(&exec);
        let advanced = store
            .transition(
                exec.id,
                &expected,
                ExecutionUpdate::from_execution(&exec, now).advance_to("pause"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(advanced.current_step_id.as_deref(), Some("pause"));

        // Replaying the same expectation conflicts
        let replay = store
            .transition(
                exec.id,
                &expected,
                ExecutionUpdate::from_execution(&exec, now).advance_to("pause"),
                None,
            )
            .await;
        assert!(matches!(replay, Err(StoreError::ConcurrencyConflict { .. })));

        let completed = store
            .transition(
                exec.id,
                &ExpectedState::of(&advanced),
                ExecutionUpdate::from_execution(&advanced, now).complete(),
                None,
            )
            .await
            .unwrap();

        let back = store
            .transition(
                exec.id,
                &ExpectedState::of(&completed),
                ExecutionUpdate::from_execution(&completed, now).advance_to("confirm"),
                None,
            )
            .await;
        assert!(matches!(back, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_log_rows_are_unique_per_attempt() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        let now = Utc::now();
        let EnrollOutcome::Enrolled(exec) = store
            .create_execution(enrollment(&def, "b", "k"), now)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };

        let log = ExecutionLog::new(&exec, "confirm", 0, now, now, LogOutcome::Success);
        let advanced = store
            .transition(
                exec.id,
                &ExpectedState::of(&exec),
                ExecutionUpdate::from_execution(&exec, now).advance_to("pause"),
                Some(log.clone()),
            )
            .await
            .unwrap();

        let mut again = log.clone();
        again.id = Uuid::now_v7();
        store
            .transition(
                exec.id,
                &ExpectedState::of(&advanced),
                ExecutionUpdate::from_execution(&advanced, now),
                Some(again),
            )
            .await
            .unwrap();

        assert_eq!(store.list_logs(exec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_attempt_lease() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        let now = Utc::now();
        let EnrollOutcome::Enrolled(exec) = store
            .create_execution(enrollment(&def, "b", "k"), now)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };

        let lease = now + Duration::seconds(60);
        assert!(store.begin_attempt(exec.id, "confirm", 0, lease, now).await.unwrap());
        assert!(!store.begin_attempt(exec.id, "confirm", 0, lease, now).await.unwrap());
        assert!(!store.begin_attempt(exec.id, "pause", 0, lease, now).await.unwrap());

        // Expired lease can be taken over
        let later = now + Duration::seconds(61);
        assert!(store
            .begin_attempt(exec.id, "confirm", 0, later + Duration::seconds(60), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_retention_never_deletes_active_executions() {
        let store = InMemoryExecutionStore::new();
        let def = store.put_definition(definition()).await.unwrap();
        let now = Utc::now();
        let EnrollOutcome::Enrolled(running) = store
            .create_execution(enrollment(&def, "b1", "k1"), now)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };
        let EnrollOutcome::Enrolled(done) = store
            .create_execution(enrollment(&def, "b2", "k2"), now)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };
        store
            .transition(
                done.id,
                &ExpectedState::of(&done),
                ExecutionUpdate::from_execution(&done, now).complete(),
                None,
            )
            .await
            .unwrap();

        let old = now - Duration::days(400);
        store.backdate_execution(running.id, old);
        store.backdate_execution(done.id, old);

        let deleted = store
            .delete_terminal_executions_before("tenant-a", now - Duration::days(180))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_execution(running.id).await.unwrap().is_some());
        assert!(store.get_execution(done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_slot_claims_are_monotonic() {
        let store = InMemoryExecutionStore::new();
        let id = Uuid::now_v7();
        let slot = Utc::now();

        assert!(store.claim_schedule_slot(id, slot).await.unwrap());
        assert!(!store.claim_schedule_slot(id, slot).await.unwrap());
        assert!(!store
            .claim_schedule_slot(id, slot - Duration::minutes(5))
            .await
            .unwrap());
        assert!(store
            .claim_schedule_slot(id, slot + Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_find_stalled_skips_leased_and_future_waits() {
        let store = InMemoryExecutionStore::new();
        let mut def = definition();
        def.steps[0] = StepDefinition::determinator(
            "confirm",
            Predicate::exists("$.subject"),
            "pause",
            "remind",
        );
        let def = store.put_definition(def).await.unwrap();
        let now = Utc::now();
        let EnrollOutcome::Enrolled(exec) = store
            .create_execution(enrollment(&def, "b", "k"), now - Duration::hours(1))
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };

        let stalled = store
            .find_stalled(now - Duration::minutes(10), now - Duration::minutes(10), now, 10)
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);

        store
            .begin_attempt(exec.id, "confirm", 0, now + Duration::minutes(1), now)
            .await
            .unwrap();
        let stalled = store
            .find_stalled(now - Duration::minutes(10), now - Duration::minutes(10), now, 10)
            .await
            .unwrap();
        assert!(stalled.is_empty());
    }
}
