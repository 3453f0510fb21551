//! Failure processor (dead-letter consumer)
//!
//! Finalises executions whose step messages exhausted their retries and
//! records dropped trigger events for manual replay.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

use super::error::EngineError;
use crate::clock::{system_clock, SharedClock};
use crate::metrics::{Counter, EngineMetrics};
use crate::persistence::{
    ExecutionLog, ExecutionStatus, ExecutionStore, ExecutionUpdate, ExpectedState, LogOutcome,
    StoreError, WorkflowExecution,
};
use crate::queue::{DeadLetter, Delivery, StepMessage, TriggerMessage};
use crate::worker::{Disposition, MessageHandler};

/// Reloads attempted when finalisation races with another writer
const FINALIZE_ATTEMPTS: usize = 3;

/// Mark `execution` failed at `step_id`, writing the final log row
///
/// Returns `Ok(false)` if the execution changed since it was loaded.
pub(crate) async fn finalize_failure(
    store: &dyn ExecutionStore,
    metrics: &EngineMetrics,
    execution: &WorkflowExecution,
    step_id: &str,
    reason: &str,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let mut update = ExecutionUpdate::from_execution(execution, now)
        .finish(ExecutionStatus::Failed, reason);
    update.failed_count += 1;

    let log = ExecutionLog::new(
        execution,
        step_id,
        execution.current_attempt,
        started_at.min(now),
        now,
        LogOutcome::Failed,
    )
    .with_error(reason);

    match store
        .transition(execution.id, &ExpectedState::of(execution), update, Some(log))
        .await
    {
        Ok(_) => {
            metrics.incr(&execution.tenant_id, Counter::Failures);
            error!(
                tenant_id = %execution.tenant_id,
                execution_id = %execution.id,
                step_id,
                attempt = execution.current_attempt,
                reason,
                "workflow execution failed"
            );
            Ok(true)
        }
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

/// What a dead-lettered step message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The execution was marked failed
    Finalized,

    /// Nothing to do: already terminal, advanced past the step, or gone
    NoOp { reason: String },
}

/// Consumes both dead-letter queues
pub struct FailureProcessor {
    store: Arc<dyn ExecutionStore>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
}

impl FailureProcessor {
    pub fn new(store: Arc<dyn ExecutionStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            metrics,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Finalise the execution behind an exhausted step message
    ///
    /// Idempotent: a second delivery of the same letter finds the execution
    /// already failed and does nothing.
    #[instrument(skip(self, letter), fields(execution_id = %letter.message.execution_id, step_id = %letter.message.step_id))]
    pub async fn process_step_failure(
        &self,
        letter: &DeadLetter<StepMessage>,
    ) -> Result<FailureOutcome, EngineError> {
        let execution_id = letter.message.execution_id;

        for _ in 0..FINALIZE_ATTEMPTS {
            let Some(execution) = self.store.get_execution(execution_id).await? else {
                warn!("dead-lettered step for unknown execution");
                return Ok(no_op("execution not found"));
            };

            if execution.status.is_terminal() {
                debug!(status = %execution.status, "execution already terminal");
                return Ok(no_op(format!("execution already {}", execution.status)));
            }

            if execution.current_step_id.as_deref() != Some(letter.message.step_id.as_str()) {
                debug!("execution advanced past the dead-lettered step");
                return Ok(no_op("execution advanced past the step"));
            }

            let now = self.clock.now();
            if finalize_failure(
                self.store.as_ref(),
                &self.metrics,
                &execution,
                &letter.message.step_id,
                &letter.failure_reason,
                execution.updated_at,
                now,
            )
            .await?
            {
                return Ok(FailureOutcome::Finalized);
            }
        }

        Err(StoreError::ConcurrencyConflict { execution_id }.into())
    }

    /// Record a trigger event that could not be enrolled
    ///
    /// No execution is created; the log line carries what manual replay needs.
    pub fn process_trigger_failure(&self, letter: &DeadLetter<TriggerMessage>) {
        let event = &letter.message;
        error!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            subject_record_id = %event.subject_record_id,
            occurred_at = %event.occurred_at,
            payload = %event.payload,
            attempt_count = letter.attempt_count,
            failure_reason = %letter.failure_reason,
            "trigger event dropped; manual replay required"
        );
        self.metrics.incr(&event.tenant_id, Counter::TriggersDropped);
    }
}

fn no_op(reason: impl Into<String>) -> FailureOutcome {
    FailureOutcome::NoOp {
        reason: reason.into(),
    }
}

#[async_trait]
impl MessageHandler<DeadLetter<StepMessage>> for FailureProcessor {
    async fn handle(&self, delivery: &Delivery<DeadLetter<StepMessage>>) -> Disposition {
        match self.process_step_failure(&delivery.message).await {
            Ok(_) => Disposition::Ack,
            Err(e) => Disposition::Retry {
                error: e.to_string(),
                delay: std::time::Duration::from_secs(5),
            },
        }
    }
}

#[async_trait]
impl MessageHandler<DeadLetter<TriggerMessage>> for FailureProcessor {
    async fn handle(&self, delivery: &Delivery<DeadLetter<TriggerMessage>>) -> Disposition {
        self.process_trigger_failure(&delivery.message);
        Disposition::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryExecutionStore, NewExecution};
    use serde_json::json;
    use uuid::Uuid;

    async fn running_execution(store: &InMemoryExecutionStore) -> WorkflowExecution {
        let outcome = store
            .create_execution(
                NewExecution {
                    tenant_id: "t".into(),
                    definition_id: Uuid::now_v7(),
                    definition_version: 1,
                    subject_record_id: "s".into(),
                    first_step_id: "notify".into(),
                    context: json!({}),
                    idempotency_key: Uuid::now_v7().to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        match outcome {
            crate::persistence::EnrollOutcome::Enrolled(e) => e,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn letter(execution_id: Uuid, step_id: &str) -> DeadLetter<StepMessage> {
        DeadLetter {
            message: StepMessage::new(execution_id, step_id, 3),
            failure_reason: "smtp: connection refused".into(),
            attempt_count: 4,
        }
    }

    #[tokio::test]
    async fn test_step_failure_finalizes_once() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let processor = FailureProcessor::new(store.clone(), metrics.clone());
        let execution = running_execution(&store).await;

        let first = processor
            .process_step_failure(&letter(execution.id, "notify"))
            .await
            .unwrap();
        let second = processor
            .process_step_failure(&letter(execution.id, "notify"))
            .await
            .unwrap();

        assert_eq!(first, FailureOutcome::Finalized);
        assert!(matches!(second, FailureOutcome::NoOp { .. }));

        let stored = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("smtp: connection refused"));

        let logs = store.list_logs(execution.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Failed);
        assert_eq!(metrics.get("t", Counter::Failures), 1);
    }

    #[tokio::test]
    async fn test_stale_letter_is_ignored() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let processor = FailureProcessor::new(store.clone(), Arc::new(EngineMetrics::new()));
        let execution = running_execution(&store).await;

        let outcome = processor
            .process_step_failure(&letter(execution.id, "some-earlier-step"))
            .await
            .unwrap();

        assert!(matches!(outcome, FailureOutcome::NoOp { .. }));
        let stored = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_trigger_failure_counts_drop() {
        let metrics = Arc::new(EngineMetrics::new());
        let processor =
            FailureProcessor::new(Arc::new(InMemoryExecutionStore::new()), metrics.clone());

        processor.process_trigger_failure(&DeadLetter {
            message: TriggerMessage::new("booking.created", "t", "b-1", json!({}), Utc::now()),
            failure_reason: "database error".into(),
            attempt_count: 5,
        });

        assert_eq!(metrics.get("t", Counter::TriggersDropped), 1);
    }
}
