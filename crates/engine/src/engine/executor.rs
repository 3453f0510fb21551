//! Step executor
//!
//! Runs one step of one execution per message. The executor never trusts
//! the message: it reloads the execution, checks that the message names the
//! current `(step, attempt)`, takes the single active-attempt lease, and
//! commits every result through a conditional write. A duplicate or
//! stale message therefore changes nothing.
//!
//! ```text
//!   StepMessage ──► load ──► stale/terminal? ──► Discarded
//!                    │
//!                    ├─ waiting ──► before wake? ──► Deferred
//!                    │              └─► running (wait step logged)
//!                    ▼
//!                 lease ──► action ────────► Advanced / Completed
//!                    │                      RetryScheduled / Exhausted / Failed
//!                    ├───► wait ──────────► Waiting
//!                    └───► determinator ──► (next step, same message)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::failure::finalize_failure;
use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::definition::{Predicate, StepDefinition, StepKind, WaitSpec, WorkflowDefinition};
use crate::handler::{HandlerError, HandlerInvocation, HandlerRegistry, SubjectSource};
use crate::metrics::{Counter, EngineMetrics};
use crate::persistence::{
    ExecutionLog, ExecutionStatus, ExecutionStore, ExecutionUpdate, ExpectedState, LogOutcome,
    PendingWake, StoreError, WorkflowExecution,
};
use crate::queue::{DelayScheduler, Delivery, MessageQueue, ScheduleHandle, StepMessage};
use crate::reliability::{with_timeout, RetryPolicy};
use crate::worker::{Disposition, MessageHandler};

/// Extra lease time beyond a step's own timeout
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Reloads attempted by [`StepExecutor::cancel`] when racing a worker
const CANCEL_ATTEMPTS: usize = 3;

/// Result of handling one step message
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step succeeded and the next step was enqueued
    Advanced { next_step_id: String },

    /// Parked at a wait step until `wake_at`
    Waiting { wake_at: DateTime<Utc> },

    /// Final step succeeded
    Completed,

    /// Transient failure; `attempt` is scheduled after `delay`
    RetryScheduled { attempt: u32, delay: Duration },

    /// Transient failure with no retries left; route the message to the DLQ
    Exhausted { reason: String },

    /// Permanent failure; the execution is already marked failed
    Failed { reason: String },

    /// Duplicate, stale or conflicting message; nothing changed
    Discarded { reason: String },

    /// Delivered before it may run; re-scheduled for `until`
    Deferred { until: DateTime<Utc> },
}

/// Internal continuation of the step loop
enum StepFlow {
    Done(StepOutcome),

    /// Committed; run the new current step under the same message
    Continue(WorkflowExecution),
}

enum Resume {
    Resumed(WorkflowExecution),
    Deferred(DateTime<Utc>),
    Conflict,
}

/// Executes workflow steps
pub struct StepExecutor {
    store: Arc<dyn ExecutionStore>,
    handlers: HandlerRegistry,
    subjects: Arc<dyn SubjectSource>,
    step_queue: Arc<dyn MessageQueue<StepMessage>>,
    scheduler: Arc<dyn DelayScheduler>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
    policy: RetryPolicy,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        handlers: HandlerRegistry,
        subjects: Arc<dyn SubjectSource>,
        step_queue: Arc<dyn MessageQueue<StepMessage>>,
        scheduler: Arc<dyn DelayScheduler>,
        metrics: Arc<EngineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            subjects,
            step_queue,
            scheduler,
            metrics,
            clock: system_clock(),
            policy: config.retry_policy(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Handle one step message
    #[instrument(skip(self), fields(execution_id = %message.execution_id, step_id = %message.step_id, attempt = message.attempt))]
    pub async fn execute(&self, message: &StepMessage) -> Result<StepOutcome, EngineError> {
        let Some(mut execution) = self.store.get_execution(message.execution_id).await? else {
            return Ok(self.discard(None, "execution not found"));
        };

        if execution.status.is_terminal() {
            let reason = format!("execution already {}", execution.status);
            return Ok(self.discard(Some(&execution), reason));
        }

        if execution.current_step_id.as_deref() != Some(message.step_id.as_str())
            || execution.current_attempt != message.attempt
        {
            return Ok(self.discard(Some(&execution), "stale step message"));
        }

        // Redelivered after exhaustion; hand it back to the dead-letter queue
        if execution.dead_lettered_at.is_some() {
            let reason = execution
                .last_error
                .clone()
                .unwrap_or_else(|| "step retries exhausted".to_string());
            debug!("attempt already dead-lettered");
            return Ok(StepOutcome::Exhausted { reason });
        }

        let Some(definition) = self
            .store
            .get_definition(execution.definition_id, execution.definition_version)
            .await?
        else {
            let reason = format!(
                "definition {} v{} not found",
                execution.definition_id, execution.definition_version
            );
            let now = self.clock.now();
            return self
                .fail_permanently(&execution, &message.step_id, reason, now)
                .await;
        };

        if execution.status == ExecutionStatus::Waiting {
            match self.resume(&execution).await? {
                Resume::Resumed(resumed) => execution = resumed,
                Resume::Deferred(until) => return Ok(StepOutcome::Deferred { until }),
                Resume::Conflict => {
                    return Ok(self.discard(Some(&execution), "concurrent wake-up"));
                }
            }
        }

        loop {
            match self.run_current_step(&definition, &execution).await? {
                StepFlow::Done(outcome) => return Ok(outcome),
                StepFlow::Continue(next) => execution = next,
            }
        }
    }

    /// Cancel a non-terminal execution
    ///
    /// Returns `false` if it was already terminal. A pending wake timer is
    /// cancelled best-effort; a late firing is discarded as stale.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> Result<bool, EngineError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let execution = self
                .store
                .get_execution(execution_id)
                .await?
                .ok_or(EngineError::ExecutionNotFound(execution_id))?;

            if execution.status.is_terminal() {
                return Ok(false);
            }

            let now = self.clock.now();
            let (step_id, attempt) = match (&execution.pending_wake, &execution.current_step_id) {
                (Some(wake), _) => (Some(wake.wait_step_id.clone()), wake.wait_attempt),
                (None, step) => (step.clone(), execution.current_attempt),
            };
            let log = step_id.map(|step| {
                ExecutionLog::new(&execution, step, attempt, now, now, LogOutcome::Cancelled)
                    .with_error(reason)
            });
            let update = ExecutionUpdate::from_execution(&execution, now)
                .finish(ExecutionStatus::Cancelled, reason);

            if self.commit(&execution, update, log).await?.is_none() {
                continue;
            }

            if let Some(handle) = execution.pending_wake.as_ref().and_then(|w| w.handle.clone()) {
                self.cancel_timer(&ScheduleHandle(handle)).await;
            }

            self.metrics
                .incr(&execution.tenant_id, Counter::Cancellations);
            info!(tenant_id = %execution.tenant_id, reason, "workflow execution cancelled");
            return Ok(true);
        }

        Err(StoreError::ConcurrencyConflict { execution_id }.into())
    }

    // =========================================================================
    // Step dispatch
    // =========================================================================

    async fn run_current_step(
        &self,
        definition: &WorkflowDefinition,
        execution: &WorkflowExecution,
    ) -> Result<StepFlow, EngineError> {
        let now = self.clock.now();
        let Some(step_id) = execution.current_step_id.clone() else {
            return Ok(StepFlow::Done(
                self.discard(Some(execution), "execution has no current step"),
            ));
        };

        let Some(step) = definition.step(&step_id) else {
            let reason = format!("step '{step_id}' not in definition v{}", definition.version);
            return self
                .fail_permanently(execution, &step_id, reason, now)
                .await
                .map(StepFlow::Done);
        };

        let lease_for = LEASE_GRACE
            + match &step.kind {
                StepKind::Action { .. } => self.config.action_timeout,
                StepKind::Determinator { .. } => self.config.determinator_timeout,
                StepKind::Wait { .. } => Duration::ZERO,
            };
        let lease_until = now + to_chrono(lease_for);

        if !self
            .store
            .begin_attempt(
                execution.id,
                &step_id,
                execution.current_attempt,
                lease_until,
                now,
            )
            .await?
        {
            // Held by another worker or still in retry backoff; look again once it lapses
            let until = execution
                .lease_expires_at
                .filter(|held| *held > now)
                .unwrap_or(lease_until);
            let message = StepMessage::new(execution.id, &step_id, execution.current_attempt);
            self.scheduler.schedule(until, &message).await?;
            debug!(%until, "attempt leased elsewhere; deferred");
            return Ok(StepFlow::Done(StepOutcome::Deferred { until }));
        }

        let result = match &step.kind {
            StepKind::Action { handler, params } => {
                self.run_action(execution, step, handler, params).await
            }
            StepKind::Wait { wait } => self.run_wait(execution, step, wait).await,
            StepKind::Determinator {
                predicate,
                on_true,
                on_false,
            } => {
                self.run_determinator(execution, step, predicate, on_true, on_false)
                    .await
            }
        };

        if result.is_err() {
            self.release_lease(execution).await;
        }
        result
    }

    async fn run_action(
        &self,
        execution: &WorkflowExecution,
        step: &StepDefinition,
        handler_name: &str,
        params: &Value,
    ) -> Result<StepFlow, EngineError> {
        let started_at = self.clock.now();

        let Some(handler) = self.handlers.get(handler_name) else {
            let reason = format!("no handler registered for '{handler_name}'");
            return self
                .fail_permanently(execution, &step.step_id, reason, started_at)
                .await
                .map(StepFlow::Done);
        };

        let invocation = HandlerInvocation::new(
            &execution.tenant_id,
            &execution.subject_record_id,
            execution.id,
            &step.step_id,
        )
        .with_attempt(execution.current_attempt, self.policy.max_attempts())
        .with_params(params.clone())
        .with_context(execution.context.clone());

        let result = match with_timeout(self.config.action_timeout, handler.handle(&invocation))
            .await
        {
            Ok(result) => result,
            Err(timeout) => Err(HandlerError::retryable(timeout.to_string()).with_type("timeout")),
        };

        match result {
            Ok(output) => self.advance(execution, step, output, started_at).await,
            Err(error) if error.retryable => {
                self.retry_or_exhaust(execution, &step.step_id, error.detail(), started_at)
                    .await
            }
            Err(error) => self
                .fail_permanently(execution, &step.step_id, error.detail(), started_at)
                .await
                .map(StepFlow::Done),
        }
    }

    async fn run_wait(
        &self,
        execution: &WorkflowExecution,
        step: &StepDefinition,
        wait: &WaitSpec,
    ) -> Result<StepFlow, EngineError> {
        let now = self.clock.now();

        let Some(next_step_id) = step.next_step_id.as_deref() else {
            let reason = format!("wait step '{}' has no next step", step.step_id);
            return self
                .fail_permanently(execution, &step.step_id, reason, now)
                .await
                .map(StepFlow::Done);
        };

        let wake_at = match wait.wake_at(now, &execution.context) {
            Ok(at) => at.max(now),
            Err(reason) => {
                let reason = format!("cannot resolve wake time: {reason}");
                return self
                    .fail_permanently(execution, &step.step_id, reason, now)
                    .await
                    .map(StepFlow::Done);
            }
        };

        // The timer is registered before parking; if parking loses a race
        // the timer is cancelled, and if cancel misses it the firing is stale.
        let timer = StepMessage::new(execution.id, next_step_id, 0);
        let handle = match self.scheduler.schedule(wake_at, &timer).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "timer registration failed");
                return self
                    .retry_or_exhaust(execution, &step.step_id, e.to_string(), now)
                    .await;
            }
        };

        let wake = PendingWake {
            wait_step_id: step.step_id.clone(),
            wait_attempt: execution.current_attempt,
            wait_started_at: now,
            wake_at,
            handle: Some(handle.0.clone()),
        };
        let update = ExecutionUpdate::from_execution(execution, now).park(next_step_id, wake);

        if self.commit(execution, update, None).await?.is_none() {
            self.cancel_timer(&handle).await;
            return Ok(StepFlow::Done(self.discard(Some(execution), "concurrent update")));
        }

        info!(%wake_at, next_step_id, "execution waiting");
        Ok(StepFlow::Done(StepOutcome::Waiting { wake_at }))
    }

    async fn run_determinator(
        &self,
        execution: &WorkflowExecution,
        step: &StepDefinition,
        predicate: &Predicate,
        on_true: &str,
        on_false: &str,
    ) -> Result<StepFlow, EngineError> {
        let started_at = self.clock.now();

        let read = with_timeout(
            self.config.determinator_timeout,
            self.subjects
                .snapshot(&execution.tenant_id, &execution.subject_record_id),
        )
        .await;

        let subject = match read {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                let reason = format!(
                    "subject record '{}' no longer exists",
                    execution.subject_record_id
                );
                return self
                    .fail_permanently(execution, &step.step_id, reason, started_at)
                    .await
                    .map(StepFlow::Done);
            }
            Ok(Err(e)) => {
                return self
                    .retry_or_exhaust(execution, &step.step_id, e.to_string(), started_at)
                    .await;
            }
            Err(timeout) => {
                return self
                    .retry_or_exhaust(execution, &step.step_id, timeout.to_string(), started_at)
                    .await;
            }
        };

        let scope = json!({ "context": execution.context, "subject": subject });
        let result = predicate.evaluate(&scope);
        let target = if result { on_true } else { on_false };

        let now = self.clock.now();
        let update = ExecutionUpdate::from_execution(execution, now)
            .with_step_output(
                &step.step_id,
                json!({ "result": result, "next_step_id": target }),
            )
            .advance_to(target);
        let log = ExecutionLog::new(
            execution,
            &step.step_id,
            execution.current_attempt,
            started_at,
            now,
            LogOutcome::Success,
        );

        match self.commit(execution, update, Some(log)).await? {
            Some(updated) => {
                debug!(result, next_step_id = target, "determinator branched");
                Ok(StepFlow::Continue(updated))
            }
            None => Ok(StepFlow::Done(self.discard(Some(execution), "concurrent update"))),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Wake a parked execution, logging its wait step
    async fn resume(&self, execution: &WorkflowExecution) -> Result<Resume, EngineError> {
        let now = self.clock.now();

        if let Some(wake) = &execution.pending_wake {
            if now < wake.wake_at {
                // Never run early; put the wake-up back for the right time
                let message = StepMessage::new(
                    execution.id,
                    execution.current_step_id.clone().unwrap_or_default(),
                    execution.current_attempt,
                );
                self.scheduler.schedule(wake.wake_at, &message).await?;
                debug!(wake_at = %wake.wake_at, "wake-up delivered early; rescheduled");
                return Ok(Resume::Deferred(wake.wake_at));
            }
        }

        let Some(step_id) = execution.current_step_id.clone() else {
            return Ok(Resume::Conflict);
        };

        let log = execution.pending_wake.as_ref().map(|wake| {
            ExecutionLog::new(
                execution,
                &wake.wait_step_id,
                wake.wait_attempt,
                wake.wait_started_at,
                now,
                LogOutcome::Success,
            )
        });
        let update = ExecutionUpdate::from_execution(execution, now).advance_to(step_id);

        match self.commit(execution, update, log).await? {
            Some(resumed) => {
                debug!("execution resumed");
                Ok(Resume::Resumed(resumed))
            }
            None => Ok(Resume::Conflict),
        }
    }

    async fn advance(
        &self,
        execution: &WorkflowExecution,
        step: &StepDefinition,
        output: Value,
        started_at: DateTime<Utc>,
    ) -> Result<StepFlow, EngineError> {
        let now = self.clock.now();
        let update =
            ExecutionUpdate::from_execution(execution, now).with_step_output(&step.step_id, output);
        let update = match &step.next_step_id {
            Some(next) => update.advance_to(next),
            None => update.complete(),
        };
        let log = ExecutionLog::new(
            execution,
            &step.step_id,
            execution.current_attempt,
            started_at,
            now,
            LogOutcome::Success,
        );

        if self.commit(execution, update, Some(log)).await?.is_none() {
            return Ok(StepFlow::Done(self.discard(Some(execution), "concurrent update")));
        }

        match &step.next_step_id {
            Some(next) => {
                // A lost send is recovered by the stalled-execution sweeper
                self.step_queue
                    .send(&StepMessage::new(execution.id, next, 0))
                    .await?;
                debug!(next_step_id = %next, "step succeeded");
                Ok(StepFlow::Done(StepOutcome::Advanced {
                    next_step_id: next.clone(),
                }))
            }
            None => {
                self.metrics
                    .incr(&execution.tenant_id, Counter::Completions);
                info!(tenant_id = %execution.tenant_id, "workflow execution completed");
                Ok(StepFlow::Done(StepOutcome::Completed))
            }
        }
    }

    /// Transient failure: schedule the next attempt, or report exhaustion
    async fn retry_or_exhaust(
        &self,
        execution: &WorkflowExecution,
        step_id: &str,
        detail: String,
        started_at: DateTime<Utc>,
    ) -> Result<StepFlow, EngineError> {
        let attempt = execution.current_attempt;

        let now = self.clock.now();

        if !self.policy.has_retries_remaining(attempt) {
            let update =
                ExecutionUpdate::from_execution(execution, now).dead_letter(detail.clone());
            if self.commit(execution, update, None).await?.is_none() {
                return Ok(StepFlow::Done(self.discard(Some(execution), "concurrent update")));
            }
            warn!(attempt, error = %detail, "step retries exhausted");
            return Ok(StepFlow::Done(StepOutcome::Exhausted { reason: detail }));
        }

        let delay = self.policy.delay_for_retry(attempt);
        let next_attempt = attempt + 1;
        let due_at = now + to_chrono(delay);

        let handle = self
            .scheduler
            .schedule(due_at, &StepMessage::new(execution.id, step_id, next_attempt))
            .await?;

        let update =
            ExecutionUpdate::from_execution(execution, now).retry(detail.clone(), due_at);
        let log = ExecutionLog::new(
            execution,
            step_id,
            attempt,
            started_at,
            now,
            LogOutcome::Retried,
        )
        .with_error(detail.clone());

        if self.commit(execution, update, Some(log)).await?.is_none() {
            self.cancel_timer(&handle).await;
            return Ok(StepFlow::Done(self.discard(Some(execution), "concurrent update")));
        }

        self.metrics.incr(&execution.tenant_id, Counter::Retries);
        warn!(attempt, ?delay, error = %detail, "step failed; retry scheduled");
        Ok(StepFlow::Done(StepOutcome::RetryScheduled {
            attempt: next_attempt,
            delay,
        }))
    }

    async fn fail_permanently(
        &self,
        execution: &WorkflowExecution,
        step_id: &str,
        reason: String,
        started_at: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let now = self.clock.now();
        let finalized = finalize_failure(
            self.store.as_ref(),
            &self.metrics,
            execution,
            step_id,
            &reason,
            started_at,
            now,
        )
        .await?;

        if finalized {
            Ok(StepOutcome::Failed { reason })
        } else {
            Ok(self.discard(Some(execution), "concurrent update"))
        }
    }

    /// Conditional write; `None` when another writer got there first
    async fn commit(
        &self,
        execution: &WorkflowExecution,
        update: ExecutionUpdate,
        log: Option<ExecutionLog>,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        match self
            .store
            .transition(execution.id, &ExpectedState::of(execution), update, log)
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_lease(&self, execution: &WorkflowExecution) {
        let update = ExecutionUpdate::from_execution(execution, self.clock.now());
        if let Err(e) = self.commit(execution, update, None).await {
            warn!(error = %e, "failed to release attempt lease");
        }
    }

    async fn cancel_timer(&self, handle: &ScheduleHandle) {
        if let Err(e) = self.scheduler.cancel(handle).await {
            warn!(%handle, error = %e, "failed to cancel timer");
        }
    }

    fn discard(&self, execution: Option<&WorkflowExecution>, reason: impl Into<String>) -> StepOutcome {
        let reason = reason.into();
        if let Some(execution) = execution {
            self.metrics
                .incr(&execution.tenant_id, Counter::DuplicatesDiscarded);
        }
        debug!(%reason, "step message discarded");
        StepOutcome::Discarded { reason }
    }
}

#[async_trait]
impl MessageHandler<StepMessage> for StepExecutor {
    async fn handle(&self, delivery: &Delivery<StepMessage>) -> Disposition {
        match self.execute(&delivery.message).await {
            Ok(StepOutcome::Exhausted { reason }) => Disposition::DeadLetter { reason },
            Ok(_) => Disposition::Ack,
            Err(e) => {
                warn!(
                    execution_id = %delivery.message.execution_id,
                    step_id = %delivery.message.step_id,
                    receive_count = delivery.receive_count,
                    error = %e,
                    "step processing failed"
                );
                Disposition::Retry {
                    error: e.to_string(),
                    delay: self
                        .policy
                        .delay_for_retry(delivery.receive_count.saturating_sub(1)),
                }
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::definition::TriggerSpec;
    use crate::handler::InMemorySubjectSource;
    use crate::persistence::{EnrollOutcome, InMemoryExecutionStore, NewExecution};
    use crate::queue::{InMemoryQueue, QueueDelayScheduler};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        clock: ManualClock,
        store: Arc<InMemoryExecutionStore>,
        steps: Arc<InMemoryQueue<StepMessage>>,
        subjects: InMemorySubjectSource,
        metrics: Arc<EngineMetrics>,
        executor: StepExecutor,
    }

    fn harness(handlers: HandlerRegistry) -> Harness {
        let clock = ManualClock::new_at_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(InMemoryExecutionStore::new());
        let steps = Arc::new(InMemoryQueue::new("steps").with_clock(shared.clone()));
        let subjects = InMemorySubjectSource::new();
        let metrics = Arc::new(EngineMetrics::new());
        let config = EngineConfig::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(60));

        let executor = StepExecutor::new(
            store.clone(),
            handlers,
            Arc::new(subjects.clone()),
            steps.clone(),
            Arc::new(QueueDelayScheduler::new(steps.clone())),
            metrics.clone(),
            config,
        )
        .with_clock(shared);

        Harness {
            clock,
            store,
            steps,
            subjects,
            metrics,
            executor,
        }
    }

    async fn enroll(h: &Harness, steps: Vec<StepDefinition>) -> WorkflowExecution {
        let definition = h
            .store
            .put_definition(WorkflowDefinition::new(
                "t",
                "test",
                TriggerSpec::Event {
                    event_type: "e".into(),
                    filter: None,
                },
                steps,
            ))
            .await
            .unwrap();

        let request = NewExecution::for_definition(
            &definition,
            "subject-1",
            json!({"event": {"payload": {}}, "steps": {}}),
            Uuid::now_v7().to_string(),
        )
        .unwrap();

        match h.store.create_execution(request, h.clock.now()).await.unwrap() {
            EnrollOutcome::Enrolled(e) => e,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn ok_handler() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ok", |_inv: HandlerInvocation| async {
            Ok::<_, HandlerError>(json!({"done": true}))
        });
        registry
    }

    #[tokio::test]
    async fn test_action_advances_and_enqueues_next() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::action("a", "ok", json!({})).then("b"),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                next_step_id: "b".into()
            }
        );
        assert_eq!(h.steps.messages(), vec![StepMessage::new(execution.id, "b", 0)]);

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_id.as_deref(), Some("b"));
        assert_eq!(stored.context["steps"]["a"]["done"], true);
        assert!(stored.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_message_changes_nothing() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::action("a", "ok", json!({})).then("b"),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;
        let message = StepMessage::new(execution.id, "a", 0);

        h.executor.execute(&message).await.unwrap();
        let after_first = h.store.get_execution(execution.id).await.unwrap().unwrap();

        h.clock.advance(chrono::Duration::seconds(5));
        let outcome = h.executor.execute(&message).await.unwrap();

        assert!(matches!(outcome, StepOutcome::Discarded { .. }));
        let after_second = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(h.store.list_logs(execution.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_schedules_next_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", move |_inv: HandlerInvocation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(HandlerError::retryable("503 from provider"))
            }
        });
        let h = harness(registry);
        let execution = enroll(&h, vec![StepDefinition::action("a", "flaky", json!({}))]).await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StepOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(h.steps.visible_len(), 0);
        assert_eq!(
            h.steps.next_visible_at(),
            Some(h.clock.now() + chrono::Duration::seconds(1))
        );

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.current_attempt, 1);
        assert_eq!(stored.failed_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.get("t", Counter::Retries), 1);
    }

    #[tokio::test]
    async fn test_last_attempt_reports_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("down", move |_inv: HandlerInvocation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(HandlerError::retryable("connection refused"))
            }
        });
        let h = harness(registry);
        let execution = enroll(&h, vec![StepDefinition::action("a", "down", json!({}))]).await;

        let mut outcome = None;
        for attempt in 0..=3 {
            outcome = Some(
                h.executor
                    .execute(&StepMessage::new(execution.id, "a", attempt))
                    .await
                    .unwrap(),
            );
            h.clock.advance(chrono::Duration::seconds(60));
        }

        let exhausted = StepOutcome::Exhausted {
            reason: "connection refused".into(),
        };
        assert_eq!(outcome, Some(exhausted.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let logs = h.store.list_logs(execution.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.outcome == LogOutcome::Retried));

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert!(stored.dead_lettered_at.is_some());

        // A redelivery goes back to the dead-letter queue without running again
        let again = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 3))
            .await
            .unwrap();
        assert_eq!(again, exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        h.clock.advance(chrono::Duration::hours(1));
        let now = h.clock.now();
        let stalled = h.store.find_stalled(now, now, now, 10).await.unwrap();
        assert!(stalled.is_empty());
    }

    #[tokio::test]
    async fn test_early_retry_delivery_waits_for_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", move |_inv: HandlerInvocation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(HandlerError::retryable("503 from provider"))
            }
        });
        let h = harness(registry);
        let execution = enroll(&h, vec![StepDefinition::action("a", "flaky", json!({}))]).await;

        h.executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();
        let due_at = h.clock.now() + chrono::Duration::seconds(1);

        let early = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 1))
            .await
            .unwrap();

        assert_eq!(early, StepOutcome::Deferred { until: due_at });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.lease_expires_at, Some(due_at));
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("strict", |_inv: HandlerInvocation| async {
            Err::<Value, _>(HandlerError::permanent("template missing").with_type("validation"))
        });
        let h = harness(registry);
        let execution = enroll(&h, vec![StepDefinition::action("a", "strict", json!({}))]).await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        let logs = h.store.list_logs(execution.id).await.unwrap();
        assert_eq!(logs[0].outcome, LogOutcome::Failed);
        assert_eq!(
            logs[0].error_detail.as_deref(),
            Some("validation: template missing")
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_is_permanent() {
        let h = harness(HandlerRegistry::new());
        let execution = enroll(&h, vec![StepDefinition::action("a", "missing", json!({}))]).await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_wait_parks_and_rejects_early_wake() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::wait("pause", WaitSpec::duration(Duration::from_secs(3600)))
                    .then("b"),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;
        let parked_at = h.clock.now();

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "pause", 0))
            .await
            .unwrap();
        let wake_at = parked_at + chrono::Duration::hours(1);
        assert_eq!(outcome, StepOutcome::Waiting { wake_at });

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Waiting);
        assert_eq!(stored.current_step_id.as_deref(), Some("b"));

        // An early delivery is pushed back, not executed
        let early = h
            .executor
            .execute(&StepMessage::new(execution.id, "b", 0))
            .await
            .unwrap();
        assert_eq!(early, StepOutcome::Deferred { until: wake_at });

        h.clock.set(wake_at);
        let resumed = h
            .executor
            .execute(&StepMessage::new(execution.id, "b", 0))
            .await
            .unwrap();
        assert_eq!(resumed, StepOutcome::Completed);

        let logs = h.store.list_logs(execution.id).await.unwrap();
        let steps: Vec<_> = logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(steps, vec!["pause", "b"]);
    }

    #[tokio::test]
    async fn test_unresolvable_wait_expression_fails() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::wait(
                    "until",
                    WaitSpec::Until {
                        path: "$.context.event.payload.missing".into(),
                        offset_ms: 0,
                    },
                )
                .then("b"),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "until", 0))
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_determinator_branches_on_subject() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::determinator(
                    "check",
                    Predicate::equals("$.subject.status", json!("confirmed")),
                    "yes",
                    "no",
                ),
                StepDefinition::action("yes", "ok", json!({})),
                StepDefinition::action("no", "ok", json!({})),
            ],
        )
        .await;
        h.subjects
            .insert("t", "subject-1", json!({"status": "confirmed"}));

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "check", 0))
            .await
            .unwrap();

        assert_eq!(outcome, StepOutcome::Completed);
        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.context["steps"]["check"]["next_step_id"], "yes");
        let logs = h.store.list_logs(execution.id).await.unwrap();
        let steps: Vec<_> = logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(steps, vec!["check", "yes"]);
    }

    #[tokio::test]
    async fn test_determinator_missing_subject_is_permanent() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::determinator("check", Predicate::exists("$.subject.id"), "a", "b"),
                StepDefinition::action("a", "ok", json!({})),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "check", 0))
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_waiting_execution_removes_timer() {
        let h = harness(ok_handler());
        let execution = enroll(
            &h,
            vec![
                StepDefinition::wait("pause", WaitSpec::duration(Duration::from_secs(60)))
                    .then("b"),
                StepDefinition::action("b", "ok", json!({})),
            ],
        )
        .await;
        h.executor
            .execute(&StepMessage::new(execution.id, "pause", 0))
            .await
            .unwrap();
        assert_eq!(h.steps.len(), 1);

        assert!(h.executor.cancel(execution.id, "subject deleted").await.unwrap());
        assert!(!h.executor.cancel(execution.id, "again").await.unwrap());

        assert!(h.steps.is_empty());
        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(h.metrics.get("t", Counter::Cancellations), 1);
    }

    #[tokio::test]
    async fn test_held_lease_defers_message() {
        let h = harness(ok_handler());
        let execution = enroll(&h, vec![StepDefinition::action("a", "ok", json!({}))]).await;
        let now = h.clock.now();
        assert!(h
            .store
            .begin_attempt(execution.id, "a", 0, now + chrono::Duration::seconds(90), now)
            .await
            .unwrap());

        let outcome = h
            .executor
            .execute(&StepMessage::new(execution.id, "a", 0))
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Deferred { .. }));
        assert_eq!(h.steps.len(), 1);
    }
}
