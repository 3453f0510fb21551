//! In-memory queue for testing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{DeadLetter, Delivery, QueueMessage};
use super::queue::{MessageQueue, NackOutcome, QueueError};
use crate::clock::{system_clock, SharedClock};

struct StoredMessage<M> {
    message: M,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
}

/// In-memory implementation of MessageQueue
///
/// Visibility is evaluated against the injected clock, so delayed messages
/// (wait steps, retry backoff) become receivable only after the clock is
/// advanced past their visibility time.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tenantflow_engine::queue::{InMemoryQueue, StepMessage, DeadLetter};
///
/// let dlq = Arc::new(InMemoryQueue::<DeadLetter<StepMessage>>::new("workflow-steps-dlq"));
/// let steps = InMemoryQueue::<StepMessage>::new("workflow-steps")
///     .with_max_receives(5)
///     .with_dead_letter_queue(dlq);
/// assert_eq!(steps.len(), 0);
/// ```
pub struct InMemoryQueue<M: QueueMessage> {
    name: String,
    clock: SharedClock,
    max_receives: u32,
    messages: RwLock<HashMap<Uuid, StoredMessage<M>>>,
    dead_letters: Option<Arc<dyn MessageQueue<DeadLetter<M>>>>,
}

impl<M: QueueMessage> InMemoryQueue<M> {
    /// Create a queue using wall-clock time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: system_clock(),
            max_receives: 5,
            messages: RwLock::new(HashMap::new()),
            dead_letters: None,
        }
    }

    /// Evaluate visibility against `clock`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Deliveries before a nacked message is dead-lettered
    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives.max(1);
        self
    }

    /// Where exhausted messages go
    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn MessageQueue<DeadLetter<M>>>) -> Self {
        self.dead_letters = Some(dlq);
        self
    }

    /// Messages stored, visible or not
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Messages receivable right now
    pub fn visible_len(&self) -> usize {
        let now = self.clock.now();
        self.messages
            .read()
            .values()
            .filter(|m| m.visible_at <= now)
            .count()
    }

    /// Earliest visibility time among stored messages
    pub fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        self.messages.read().values().map(|m| m.visible_at).min()
    }

    /// Copies of every stored message, ordered by visibility
    pub fn messages(&self) -> Vec<M> {
        let messages = self.messages.read();
        let mut stored: Vec<_> = messages.iter().collect();
        stored.sort_by_key(|(id, m)| (m.visible_at, **id));
        stored.into_iter().map(|(_, m)| m.message.clone()).collect()
    }

    fn insert(&self, message: &M, visible_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::now_v7();
        self.messages.write().insert(
            id,
            StoredMessage {
                message: message.clone(),
                visible_at,
                receive_count: 0,
                enqueued_at: self.clock.now(),
            },
        );
        id
    }

    async fn move_to_dlq(&self, delivery: &Delivery<M>, reason: &str) -> Result<(), QueueError> {
        let dlq = self
            .dead_letters
            .as_ref()
            .ok_or_else(|| QueueError::NoDeadLetterQueue(self.name.clone()))?;

        dlq.send(&DeadLetter {
            message: delivery.message.clone(),
            failure_reason: reason.to_string(),
            attempt_count: delivery.receive_count,
        })
        .await?;

        self.messages.write().remove(&delivery.id);
        debug!(queue = %self.name, id = %delivery.id, "moved message to dead-letter queue");
        Ok(())
    }
}

#[async_trait]
impl<M: QueueMessage> MessageQueue<M> for InMemoryQueue<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &M) -> Result<Uuid, QueueError> {
        Ok(self.insert(message, self.clock.now()))
    }

    async fn send_at(&self, message: &M, visible_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        Ok(self.insert(message, visible_at))
    }

    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery<M>>, QueueError> {
        let now = self.clock.now();
        let hidden_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut messages = self.messages.write();
        let mut ready: Vec<(Uuid, DateTime<Utc>)> = messages
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(id, m)| (*id, m.visible_at))
            .collect();
        ready.sort_by_key(|(id, visible_at)| (*visible_at, *id));
        ready.truncate(max);

        let mut deliveries = Vec::with_capacity(ready.len());
        for (id, _) in ready {
            if let Some(stored) = messages.get_mut(&id) {
                stored.visible_at = hidden_until;
                stored.receive_count += 1;
                deliveries.push(Delivery {
                    id,
                    message: stored.message.clone(),
                    receive_count: stored.receive_count,
                    enqueued_at: stored.enqueued_at,
                });
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        self.messages.write().remove(&id);
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery<M>,
        error: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueError> {
        if delivery.receive_count >= self.max_receives && self.dead_letters.is_some() {
            self.move_to_dlq(delivery, error).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        if delivery.receive_count >= self.max_receives {
            warn!(queue = %self.name, id = %delivery.id, "receive budget spent but no dead-letter queue configured");
        }

        let visible_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(stored) = self.messages.write().get_mut(&delivery.id) {
            stored.visible_at = visible_at;
        }
        Ok(NackOutcome::Requeued)
    }

    async fn dead_letter(&self, delivery: &Delivery<M>, reason: &str) -> Result<(), QueueError> {
        self.move_to_dlq(delivery, reason).await
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut messages = self.messages.write();
        match messages.get(&id) {
            Some(stored) if stored.receive_count == 0 => {
                messages.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
