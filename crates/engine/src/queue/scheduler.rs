//! Delay scheduler
//!
//! Durable timers for wait steps and retry backoff. The timer is a step
//! message enqueued with a future visibility time; no worker blocks or
//! polls per timer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::message::StepMessage;
use super::queue::MessageQueue;

/// Opaque handle for cancelling a scheduled delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleHandle(pub String);

impl std::fmt::Display for ScheduleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error from the delay scheduler
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The timer could not be registered
    #[error("failed to register timer: {0}")]
    Registration(String),

    /// The timer could not be cancelled
    #[error("failed to cancel timer: {0}")]
    Cancellation(String),
}

/// Durable timer service
///
/// Delivers `payload` to the step queue at or after `wake_at`, at least
/// once. Cancellation is best-effort; a late firing is absorbed by the
/// step executor's stale-message check.
#[async_trait]
pub trait DelayScheduler: Send + Sync + 'static {
    async fn schedule(
        &self,
        wake_at: DateTime<Utc>,
        payload: &StepMessage,
    ) -> Result<ScheduleHandle, SchedulerError>;

    /// Returns `true` if the timer was removed before firing
    async fn cancel(&self, handle: &ScheduleHandle) -> Result<bool, SchedulerError>;
}

/// Delay scheduler backed by the step queue's delayed visibility
#[derive(Clone)]
pub struct QueueDelayScheduler {
    queue: Arc<dyn MessageQueue<StepMessage>>,
}

impl QueueDelayScheduler {
    pub fn new(queue: Arc<dyn MessageQueue<StepMessage>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DelayScheduler for QueueDelayScheduler {
    async fn schedule(
        &self,
        wake_at: DateTime<Utc>,
        payload: &StepMessage,
    ) -> Result<ScheduleHandle, SchedulerError> {
        let id = self
            .queue
            .send_at(payload, wake_at)
            .await
            .map_err(|e| SchedulerError::Registration(e.to_string()))?;

        debug!(
            execution_id = %payload.execution_id,
            step_id = %payload.step_id,
            %wake_at,
            "scheduled delayed step"
        );
        Ok(ScheduleHandle(id.to_string()))
    }

    async fn cancel(&self, handle: &ScheduleHandle) -> Result<bool, SchedulerError> {
        let id = Uuid::parse_str(&handle.0)
            .map_err(|e| SchedulerError::Cancellation(format!("invalid handle {handle}: {e}")))?;

        self.queue
            .cancel(id)
            .await
            .map_err(|e| SchedulerError::Cancellation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::queue::InMemoryQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_schedule_delivers_at_wake_time() {
        let clock = ManualClock::new_at_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryQueue::<StepMessage>::new("steps").with_clock(shared));
        let scheduler = QueueDelayScheduler::new(queue.clone());

        let msg = StepMessage::new(Uuid::now_v7(), "remind", 0);
        let wake_at = clock.now() + chrono::Duration::days(3);
        scheduler.schedule(wake_at, &msg).await.unwrap();

        assert_eq!(queue.visible_len(), 0);
        assert_eq!(queue.next_visible_at(), Some(wake_at));

        clock.set(wake_at);
        let received = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(received[0].message, msg);
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_timer() {
        let queue = Arc::new(InMemoryQueue::<StepMessage>::new("steps"));
        let scheduler = QueueDelayScheduler::new(queue.clone());

        let handle = scheduler
            .schedule(
                Utc::now() + chrono::Duration::hours(1),
                &StepMessage::new(Uuid::now_v7(), "a", 0),
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(&handle).await.unwrap());
        assert!(!scheduler.cancel(&handle).await.unwrap());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_rejects_garbage_handle() {
        let queue = Arc::new(InMemoryQueue::<StepMessage>::new("steps"));
        let scheduler = QueueDelayScheduler::new(queue);

        let result = scheduler.cancel(&ScheduleHandle("not-a-uuid".into())).await;
        assert!(matches!(result, Err(SchedulerError::Cancellation(_))));
    }
}
