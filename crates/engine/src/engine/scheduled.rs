//! Scheduled trigger poller
//!
//! Enrolls the subjects returned by each due schedule's query. Enrollments
//! use the slot start as `occurred_at`, so re-running a slot (after a crash,
//! or on a second worker) is suppressed by the idempotency key. The slot is
//! claimed only after its enrollments went through.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::trigger::TriggerProcessor;
use crate::clock::{system_clock, SharedClock};
use crate::definition::{SubjectQuery, TriggerSpec, WorkflowDefinition};
use crate::handler::SubjectSource;
use crate::persistence::{EnrollOutcome, ExecutionStore};
use crate::worker::PeriodicJob;

/// Totals of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Definitions whose slot fired
    pub fired: usize,
    pub enrolled: usize,
    pub duplicates: usize,

    /// Definitions skipped because their query or an enrollment failed
    pub failed: Vec<Uuid>,
}

/// Event type recorded for a scheduled enrollment
pub fn scheduled_event_type(query: &SubjectQuery) -> String {
    format!("schedule:{}", query.name)
}

/// Fires due scheduled definitions
pub struct ScheduledTriggerPoller {
    store: Arc<dyn ExecutionStore>,
    subjects: Arc<dyn SubjectSource>,
    triggers: Arc<TriggerProcessor>,
    clock: SharedClock,
}

impl ScheduledTriggerPoller {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        subjects: Arc<dyn SubjectSource>,
        triggers: Arc<TriggerProcessor>,
    ) -> Self {
        Self {
            store,
            subjects,
            triggers,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Fire every scheduled definition whose slot is due
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<ScheduleReport, EngineError> {
        let now = self.clock.now();
        let mut report = ScheduleReport::default();

        for scheduled in self.store.scheduled_definitions().await? {
            let definition = &scheduled.definition;
            let TriggerSpec::Schedule { schedule, query } = &definition.trigger else {
                continue;
            };

            let Some(slot) = schedule.current_slot(now) else {
                continue;
            };
            if !schedule.is_due(scheduled.last_slot, now) {
                continue;
            }

            match self.fire(definition, query, slot, now).await {
                Ok((enrolled, duplicates)) => {
                    if !self.store.claim_schedule_slot(definition.id, slot).await? {
                        debug!(definition_id = %definition.id, %slot, "slot already claimed");
                    }
                    report.fired += 1;
                    report.enrolled += enrolled;
                    report.duplicates += duplicates;
                }
                Err(e) => {
                    warn!(
                        tenant_id = %definition.tenant_id,
                        definition_id = %definition.id,
                        query = %query.name,
                        error = %e,
                        "scheduled trigger failed; retrying next poll"
                    );
                    report.failed.push(definition.id);
                }
            }
        }

        if report.fired > 0 || !report.failed.is_empty() {
            info!(
                fired = report.fired,
                enrolled = report.enrolled,
                duplicates = report.duplicates,
                failed = report.failed.len(),
                "scheduled triggers polled"
            );
        }
        Ok(report)
    }

    async fn fire(
        &self,
        definition: &WorkflowDefinition,
        query: &SubjectQuery,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), EngineError> {
        let matches = self
            .subjects
            .query(&definition.tenant_id, query, now)
            .await?;
        let event_type = scheduled_event_type(query);

        let mut enrolled = 0;
        let mut duplicates = 0;
        for subject in &matches {
            match self
                .triggers
                .enroll(
                    definition,
                    &subject.subject_record_id,
                    &event_type,
                    &subject.payload,
                    slot,
                )
                .await?
            {
                EnrollOutcome::Enrolled(_) => enrolled += 1,
                EnrollOutcome::Duplicate { .. } => duplicates += 1,
            }
        }
        Ok((enrolled, duplicates))
    }
}

#[async_trait]
impl PeriodicJob for ScheduledTriggerPoller {
    fn name(&self) -> &'static str {
        "scheduled-triggers"
    }

    async fn tick(&self) -> Result<(), EngineError> {
        self.poll_once().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::definition::{ScheduleSpec, StepDefinition};
    use crate::handler::{InMemorySubjectSource, SubjectMatch};
    use crate::metrics::EngineMetrics;
    use crate::persistence::InMemoryExecutionStore;
    use crate::queue::{InMemoryQueue, StepMessage};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        clock: ManualClock,
        store: Arc<InMemoryExecutionStore>,
        subjects: InMemorySubjectSource,
        steps: Arc<InMemoryQueue<StepMessage>>,
        poller: ScheduledTriggerPoller,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(
            DateTime::parse_from_rfc3339("2026-05-04T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(InMemoryExecutionStore::new());
        let subjects = InMemorySubjectSource::new();
        let steps = Arc::new(InMemoryQueue::new("steps"));
        let triggers = Arc::new(
            TriggerProcessor::new(
                store.clone(),
                steps.clone(),
                Arc::new(EngineMetrics::new()),
                EngineConfig::default(),
            )
            .with_clock(shared.clone()),
        );
        let poller = ScheduledTriggerPoller::new(store.clone(), Arc::new(subjects.clone()), triggers)
            .with_clock(shared);
        Fixture {
            clock,
            store,
            subjects,
            steps,
            poller,
        }
    }

    async fn vaccination_reminder(f: &Fixture) -> WorkflowDefinition {
        f.store
            .put_definition(WorkflowDefinition::new(
                "clinic",
                "vaccination reminder",
                TriggerSpec::Schedule {
                    schedule: ScheduleSpec::daily_at(8, 0),
                    query: SubjectQuery::new("vaccination_due", json!({"within_days": 7})),
                },
                vec![StepDefinition::action("remind", "send_sms", json!({}))],
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_due_schedule_enrolls_each_match_once() {
        let f = fixture();
        vaccination_reminder(&f).await;
        f.subjects.set_query_results(
            "clinic",
            "vaccination_due",
            vec![
                SubjectMatch::new("pet-1", json!({"name": "Rex"})),
                SubjectMatch::new("pet-2", json!({"name": "Tom"})),
            ],
        );

        let first = f.poller.poll_once().await.unwrap();
        assert_eq!(first.fired, 1);
        assert_eq!(first.enrolled, 2);
        assert_eq!(f.steps.len(), 2);

        // Same slot: nothing fires again
        f.clock.advance(chrono::Duration::minutes(5));
        let second = f.poller.poll_once().await.unwrap();
        assert_eq!(second, ScheduleReport::default());

        let executions = f.store.executions_for_subject("clinic", "pet-1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].context["event"]["type"], "schedule:vaccination_due");
        assert_eq!(
            executions[0].context["event"]["occurred_at"],
            "2026-05-04T08:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_weekday_cron_fires_only_on_weekdays() {
        let f = fixture();
        f.store
            .put_definition(WorkflowDefinition::new(
                "clinic",
                "weekday digest",
                TriggerSpec::Schedule {
                    schedule: ScheduleSpec::cron("0 8 * * Mon-Fri"),
                    query: SubjectQuery::new("open_cases", json!({})),
                },
                vec![StepDefinition::action("digest", "send_email", json!({}))],
            ))
            .await
            .unwrap();
        f.subjects.set_query_results("clinic", "open_cases", vec![]);

        // Monday 2026-05-04 08:30, then one poll per day through next Monday
        let mut fired = vec![f.poller.poll_once().await.unwrap().fired];
        for _ in 0..7 {
            f.clock.advance(chrono::Duration::days(1));
            fired.push(f.poller.poll_once().await.unwrap().fired);
        }

        assert_eq!(fired, vec![1, 1, 1, 1, 1, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_failed_query_leaves_slot_unclaimed() {
        let f = fixture();
        let definition = vaccination_reminder(&f).await;

        let report = f.poller.poll_once().await.unwrap();
        assert_eq!(report.failed, vec![definition.id]);

        f.subjects.set_query_results(
            "clinic",
            "vaccination_due",
            vec![SubjectMatch::new("pet-1", json!({}))],
        );
        f.clock.advance(chrono::Duration::from_std(Duration::from_secs(60)).unwrap());
        let retried = f.poller.poll_once().await.unwrap();
        assert_eq!(retried.enrolled, 1);
    }
}
