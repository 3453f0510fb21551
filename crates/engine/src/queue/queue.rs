//! MessageQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::message::{Delivery, QueueMessage};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No dead-letter queue is configured
    #[error("queue '{0}' has no dead-letter queue")]
    NoDeadLetterQueue(String),
}

/// What happened to a negatively acknowledged message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Will be delivered again after the delay
    Requeued,

    /// Exceeded its receive budget and moved to the dead-letter queue
    DeadLettered,
}

/// At-least-once queue with delayed visibility
///
/// Messages may be delivered more than once and in any order. A received
/// message stays invisible for its visibility timeout; if it is neither
/// acked nor nacked by then it is delivered again.
#[async_trait]
pub trait MessageQueue<M: QueueMessage>: Send + Sync + 'static {
    /// Queue name, e.g. `workflow-steps`
    fn name(&self) -> &str;

    /// Enqueue for immediate delivery
    async fn send(&self, message: &M) -> Result<Uuid, QueueError>;

    /// Enqueue for delivery at or after `visible_at`
    async fn send_at(&self, message: &M, visible_at: DateTime<Utc>) -> Result<Uuid, QueueError>;

    /// Receive up to `max` visible messages
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery<M>>, QueueError>;

    /// Remove a processed message
    async fn ack(&self, id: Uuid) -> Result<(), QueueError>;

    /// Return a message for redelivery after `delay`, or dead-letter it once
    /// its receive budget is spent
    async fn nack(
        &self,
        delivery: &Delivery<M>,
        error: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueError>;

    /// Move a message straight to the dead-letter queue
    async fn dead_letter(&self, delivery: &Delivery<M>, reason: &str) -> Result<(), QueueError>;

    /// Delete a message that has not been delivered yet
    ///
    /// Returns `false` if it was already delivered or does not exist.
    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError>;
}
