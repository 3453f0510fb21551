//! Stalled execution sweeper
//!
//! Step messages are sent after the state change they follow, so a crash in
//! between leaves a `running` execution nobody will touch, or a `waiting`
//! one whose timer never fires. The sweeper re-sends the current step's
//! message for such rows; the executor discards any duplicate it creates.
//!
//! A retry waiting out its backoff holds the attempt's lease until it is
//! due, and an exhausted attempt is marked dead-lettered; neither is swept.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::error::EngineError;
use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::persistence::ExecutionStore;
use crate::queue::{MessageQueue, StepMessage};
use crate::worker::PeriodicJob;

const SWEEP_BATCH: usize = 100;

pub struct StalledExecutionSweeper {
    store: Arc<dyn ExecutionStore>,
    step_queue: Arc<dyn MessageQueue<StepMessage>>,
    clock: SharedClock,
    config: EngineConfig,
}

impl StalledExecutionSweeper {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        step_queue: Arc<dyn MessageQueue<StepMessage>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            step_queue,
            clock: system_clock(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Re-enqueue stalled executions; returns how many were nudged
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.stalled_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = now - threshold;

        let stalled = self
            .store
            .find_stalled(cutoff, cutoff, now, SWEEP_BATCH)
            .await?;

        let mut nudged = 0;
        for execution in &stalled {
            let Some(step_id) = execution.current_step_id.as_deref() else {
                continue;
            };
            warn!(
                tenant_id = %execution.tenant_id,
                execution_id = %execution.id,
                status = %execution.status,
                step_id,
                attempt = execution.current_attempt,
                "re-enqueueing stalled execution"
            );
            self.step_queue
                .send(&StepMessage::new(
                    execution.id,
                    step_id,
                    execution.current_attempt,
                ))
                .await?;
            nudged += 1;
        }

        if nudged > 0 {
            info!(count = nudged, "stalled executions re-enqueued");
        }
        Ok(nudged)
    }
}

#[async_trait]
impl PeriodicJob for StalledExecutionSweeper {
    fn name(&self) -> &'static str {
        "stalled-sweeper"
    }

    async fn tick(&self) -> Result<(), EngineError> {
        self.sweep_once().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::persistence::{EnrollOutcome, InMemoryExecutionStore, NewExecution};
    use crate::queue::InMemoryQueue;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_only_old_unleased_executions_are_nudged() {
        let clock = ManualClock::new_at_now();
        let store = Arc::new(InMemoryExecutionStore::new());
        let steps = Arc::new(InMemoryQueue::new("steps"));
        let sweeper = StalledExecutionSweeper::new(
            store.clone(),
            steps.clone(),
            EngineConfig::default().with_stalled_threshold(Duration::from_secs(600)),
        )
        .with_clock(Arc::new(clock.clone()));

        let mut ids = Vec::new();
        for subject in ["a", "b"] {
            let outcome = store
                .create_execution(
                    NewExecution {
                        tenant_id: "t".into(),
                        definition_id: Uuid::now_v7(),
                        definition_version: 1,
                        subject_record_id: subject.into(),
                        first_step_id: "first".into(),
                        context: json!({}),
                        idempotency_key: subject.into(),
                    },
                    clock.now(),
                )
                .await
                .unwrap();
            let EnrollOutcome::Enrolled(execution) = outcome else {
                panic!("expected enrollment");
            };
            ids.push(execution.id);
        }

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(11));
        let now = clock.now();
        store
            .begin_attempt(ids[1], "first", 0, now + chrono::Duration::minutes(1), now)
            .await
            .unwrap();

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(steps.messages(), vec![StepMessage::new(ids[0], "first", 0)]);
    }
}
