//! Trigger processor
//!
//! Turns domain events into enrollments. Every enrollment, event-driven or
//! scheduled, goes through [`TriggerProcessor::enroll`], which derives the
//! idempotency key and relies on the store's two enrollment guards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::EngineError;
use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::metrics::{Counter, EngineMetrics};
use crate::persistence::{initial_context, EnrollOutcome, ExecutionStore, NewExecution};
use crate::queue::{Delivery, MessageQueue, StepMessage, TriggerMessage};
use crate::worker::{Disposition, MessageHandler};

/// What one trigger message did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Executions created
    pub enrolled: Vec<Uuid>,

    /// Matches suppressed by an idempotency guard
    pub duplicates: usize,

    /// Active definitions for the event type whose filter rejected the payload
    pub filtered: usize,
}

/// Idempotency key of an enrollment
///
/// Redeliveries of the same event always produce the same key.
pub fn idempotency_key(
    tenant_id: &str,
    definition_id: Uuid,
    subject_record_id: &str,
    occurred_at: DateTime<Utc>,
) -> String {
    format!(
        "{tenant_id}:{definition_id}:{subject_record_id}:{}",
        occurred_at.timestamp_millis()
    )
}

/// Consumes domain events and enrolls subjects
pub struct TriggerProcessor {
    store: Arc<dyn ExecutionStore>,
    step_queue: Arc<dyn MessageQueue<StepMessage>>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
    config: EngineConfig,
}

impl TriggerProcessor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        step_queue: Arc<dyn MessageQueue<StepMessage>>,
        metrics: Arc<EngineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            step_queue,
            metrics,
            clock: system_clock(),
            config,
        }
    }

    /// Stamp enrollments with `clock`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Match an event against the tenant's active definitions and enroll
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: &TriggerMessage) -> Result<TriggerReport, EngineError> {
        let definitions = self
            .store
            .active_definitions_for_event(&event.tenant_id, &event.event_type)
            .await?;

        let mut report = TriggerReport::default();
        for definition in &definitions {
            if !definition.matches_event(&event.event_type, &event.payload) {
                report.filtered += 1;
                continue;
            }

            match self
                .enroll(
                    definition,
                    &event.subject_record_id,
                    &event.event_type,
                    &event.payload,
                    event.occurred_at,
                )
                .await?
            {
                EnrollOutcome::Enrolled(execution) => report.enrolled.push(execution.id),
                EnrollOutcome::Duplicate { .. } => report.duplicates += 1,
            }
        }

        if definitions.is_empty() {
            debug!("no active definitions for event");
        }

        Ok(report)
    }

    /// Enroll `subject_record_id` into `definition` and enqueue its first step
    ///
    /// A duplicate enrollment is suppressed and nothing is enqueued.
    #[instrument(skip(self, definition, payload), fields(tenant_id = %definition.tenant_id, definition_id = %definition.id))]
    pub async fn enroll(
        &self,
        definition: &WorkflowDefinition,
        subject_record_id: &str,
        event_type: &str,
        payload: &Value,
        occurred_at: DateTime<Utc>,
    ) -> Result<EnrollOutcome, EngineError> {
        let key = idempotency_key(
            &definition.tenant_id,
            definition.id,
            subject_record_id,
            occurred_at,
        );
        let context = initial_context(event_type, payload, occurred_at);

        let Some(request) = NewExecution::for_definition(definition, subject_record_id, context, key)
        else {
            warn!("definition has no steps; nothing to enroll");
            return Err(crate::definition::DefinitionError::NoSteps.into());
        };
        let first_step_id = request.first_step_id.clone();

        let outcome = self.store.create_execution(request, self.clock.now()).await?;

        match &outcome {
            EnrollOutcome::Enrolled(execution) => {
                // If this send is lost the stalled-execution sweeper re-enqueues the step
                self.step_queue
                    .send(&StepMessage::new(execution.id, &first_step_id, 0))
                    .await?;

                self.metrics
                    .incr(&definition.tenant_id, Counter::Enrollments);
                info!(
                    execution_id = %execution.id,
                    subject_record_id,
                    version = definition.version,
                    "enrolled subject"
                );
            }
            EnrollOutcome::Duplicate { existing_id } => {
                self.metrics
                    .incr(&definition.tenant_id, Counter::DuplicatesDiscarded);
                debug!(
                    %existing_id,
                    subject_record_id,
                    "duplicate enrollment suppressed"
                );
            }
        }

        Ok(outcome)
    }

    fn redelivery_delay(&self, receive_count: u32) -> std::time::Duration {
        self.config
            .retry_policy()
            .delay_for_retry(receive_count.saturating_sub(1))
    }
}

#[async_trait]
impl MessageHandler<TriggerMessage> for TriggerProcessor {
    async fn handle(&self, delivery: &Delivery<TriggerMessage>) -> Disposition {
        match self.process_event(&delivery.message).await {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                warn!(
                    tenant_id = %delivery.message.tenant_id,
                    event_type = %delivery.message.event_type,
                    receive_count = delivery.receive_count,
                    error = %e,
                    "trigger processing failed"
                );
                Disposition::Retry {
                    error: e.to_string(),
                    delay: self.redelivery_delay(delivery.receive_count),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Predicate, StepDefinition, TriggerSpec};
    use crate::persistence::InMemoryExecutionStore;
    use crate::queue::InMemoryQueue;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryExecutionStore>,
        steps: Arc<InMemoryQueue<StepMessage>>,
        metrics: Arc<EngineMetrics>,
        processor: TriggerProcessor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryExecutionStore::new());
        let steps = Arc::new(InMemoryQueue::new("steps"));
        let metrics = Arc::new(EngineMetrics::new());
        let processor = TriggerProcessor::new(
            store.clone(),
            steps.clone(),
            metrics.clone(),
            EngineConfig::default(),
        );
        Fixture {
            store,
            steps,
            metrics,
            processor,
        }
    }

    fn booking_definition(filter: Option<Predicate>) -> WorkflowDefinition {
        WorkflowDefinition::new(
            "tenant-1",
            "booking follow-up",
            TriggerSpec::Event {
                event_type: "booking.created".into(),
                filter,
            },
            vec![StepDefinition::action("confirm", "send_email", json!({}))],
        )
    }

    fn event(occurred_at: DateTime<Utc>) -> TriggerMessage {
        TriggerMessage::new(
            "booking.created",
            "tenant-1",
            "booking-9",
            json!({"channel": "web"}),
            occurred_at,
        )
    }

    #[tokio::test]
    async fn test_event_enrolls_and_enqueues_first_step() {
        let f = fixture();
        f.store.put_definition(booking_definition(None)).await.unwrap();

        let report = f.processor.process_event(&event(Utc::now())).await.unwrap();

        assert_eq!(report.enrolled.len(), 1);
        let queued = f.steps.messages();
        assert_eq!(queued, vec![StepMessage::new(report.enrolled[0], "confirm", 0)]);
        assert_eq!(f.metrics.get("tenant-1", Counter::Enrollments), 1);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_suppressed() {
        let f = fixture();
        f.store.put_definition(booking_definition(None)).await.unwrap();
        let occurred_at = Utc::now();

        f.processor.process_event(&event(occurred_at)).await.unwrap();
        let second = f.processor.process_event(&event(occurred_at)).await.unwrap();

        assert!(second.enrolled.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(f.steps.len(), 1);
        assert_eq!(f.store.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_filter_rejects_non_matching_payload() {
        let f = fixture();
        f.store
            .put_definition(booking_definition(Some(Predicate::equals(
                "$.channel",
                json!("phone"),
            ))))
            .await
            .unwrap();

        let report = f.processor.process_event(&event(Utc::now())).await.unwrap();

        assert!(report.enrolled.is_empty());
        assert_eq!(report.filtered, 1);
        assert!(f.steps.is_empty());
    }

    #[tokio::test]
    async fn test_other_tenant_definitions_are_ignored() {
        let f = fixture();
        let mut other = booking_definition(None);
        other.tenant_id = "tenant-2".into();
        f.store.put_definition(other).await.unwrap();

        let report = f.processor.process_event(&event(Utc::now())).await.unwrap();
        assert_eq!(report, TriggerReport::default());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = Uuid::now_v7();
        let at = Utc::now();
        assert_eq!(
            idempotency_key("t", id, "s", at),
            idempotency_key("t", id, "s", at)
        );
        assert_ne!(
            idempotency_key("t", id, "s", at),
            idempotency_key("t", id, "s", at + chrono::Duration::milliseconds(1))
        );
    }
}
