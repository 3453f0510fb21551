//! PostgreSQL-backed queue
//!
//! All logical queues share `workflow_queue_messages`, partitioned by
//! `queue_name`. Receiving uses `FOR UPDATE SKIP LOCKED` so many workers
//! can poll the same queue without contention; delayed delivery is just a
//! future `visible_at`, which is what lets wait steps park for months at
//! the cost of one row.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::message::{DeadLetter, Delivery, QueueMessage};
use super::queue::{MessageQueue, NackOutcome, QueueError};
use crate::clock::{system_clock, SharedClock};

/// PostgreSQL implementation of MessageQueue
///
/// # Example
///
/// ```ignore
/// let steps: PostgresQueue<StepMessage> = PostgresQueue::new(pool.clone(), "workflow-steps");
/// let dlq = steps.dead_letter_queue(); // "workflow-steps-dlq"
/// ```
pub struct PostgresQueue<M> {
    pool: PgPool,
    name: String,
    max_receives: u32,
    clock: SharedClock,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for PostgresQueue<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            name: self.name.clone(),
            max_receives: self.max_receives,
            clock: self.clock.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: QueueMessage> PostgresQueue<M> {
    /// Create a queue handle for `name`
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            max_receives: 5,
            clock: system_clock(),
            _message: PhantomData,
        }
    }

    /// Deliveries before a nacked message is dead-lettered
    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives.max(1);
        self
    }

    /// Evaluate visibility against `clock`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Name of the paired dead-letter queue
    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}-dlq", self.name)
    }

    /// Handle for the paired dead-letter queue
    pub fn dead_letter_queue(&self) -> PostgresQueue<DeadLetter<M>> {
        PostgresQueue {
            pool: self.pool.clone(),
            name: self.dead_letter_queue_name(),
            max_receives: self.max_receives,
            clock: self.clock.clone(),
            _message: PhantomData,
        }
    }

    async fn insert(&self, message: &M, visible_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        let payload =
            serde_json::to_value(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO workflow_queue_messages (id, queue_name, payload, visible_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(&payload)
        .bind(visible_at)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue message: {}", e);
            QueueError::Database(e.to_string())
        })?;

        Ok(id)
    }

    /// Move a row to the dead-letter queue, merging the diagnostics into its payload
    async fn move_to_dlq(
        &self,
        id: Uuid,
        reason: &str,
        attempt_count: u32,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE workflow_queue_messages
            SET queue_name = $2,
                payload = payload || jsonb_build_object('failureReason', $3::text, 'attemptCount', $4::int),
                visible_at = $5,
                receive_count = 0,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(self.dead_letter_queue_name())
        .bind(reason)
        .bind(attempt_count as i32)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to dead-letter message: {}", e);
            QueueError::Database(e.to_string())
        })?;

        debug!(queue = %self.name, %id, "moved message to dead-letter queue");
        Ok(())
    }
}

#[async_trait]
impl<M: QueueMessage> MessageQueue<M> for PostgresQueue<M> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, message), fields(queue = %self.name))]
    async fn send(&self, message: &M) -> Result<Uuid, QueueError> {
        self.insert(message, self.clock.now()).await
    }

    #[instrument(skip(self, message), fields(queue = %self.name))]
    async fn send_at(&self, message: &M, visible_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        self.insert(message, visible_at).await
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery<M>>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        let hidden_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM workflow_queue_messages
                WHERE queue_name = $1
                  AND visible_at <= $2
                ORDER BY visible_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_queue_messages m
            SET visible_at = $4,
                receive_count = receive_count + 1
            FROM claimable c
            WHERE m.id = c.id
            RETURNING m.id, m.payload, m.receive_count, m.created_at
            "#,
        )
        .bind(&self.name)
        .bind(now)
        .bind(max as i64)
        .bind(hidden_until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to receive messages: {}", e);
            QueueError::Database(e.to_string())
        })?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let receive_count = row.get::<i32, _>("receive_count") as u32;
            let payload: serde_json::Value = row.get("payload");

            match serde_json::from_value::<M>(payload) {
                Ok(message) => deliveries.push(Delivery {
                    id,
                    message,
                    receive_count,
                    enqueued_at: row.get("created_at"),
                }),
                Err(e) => {
                    // Poison message: it can never be handled, so park it for inspection
                    warn!(queue = %self.name, %id, error = %e, "undecodable message dead-lettered");
                    self.move_to_dlq(id, &format!("undecodable payload: {e}"), receive_count)
                        .await?;
                }
            }
        }

        if !deliveries.is_empty() {
            debug!(queue = %self.name, count = deliveries.len(), "received messages");
        }

        Ok(deliveries)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM workflow_queue_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to ack message: {}", e);
                QueueError::Database(e.to_string())
            })?;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(queue = %self.name, id = %delivery.id))]
    async fn nack(
        &self,
        delivery: &Delivery<M>,
        error: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueError> {
        if delivery.receive_count >= self.max_receives {
            self.move_to_dlq(delivery.id, error, delivery.receive_count)
                .await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        sqlx::query(
            "UPDATE workflow_queue_messages SET visible_at = $2, last_error = $3 WHERE id = $1",
        )
        .bind(delivery.id)
        .bind(visible_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to nack message: {}", e);
            QueueError::Database(e.to_string())
        })?;

        Ok(NackOutcome::Requeued)
    }

    #[instrument(skip(self, delivery), fields(queue = %self.name, id = %delivery.id))]
    async fn dead_letter(&self, delivery: &Delivery<M>, reason: &str) -> Result<(), QueueError> {
        self.move_to_dlq(delivery.id, reason, delivery.receive_count)
            .await
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "DELETE FROM workflow_queue_messages WHERE id = $1 AND queue_name = $2 AND receive_count = 0",
        )
        .bind(id)
        .bind(&self.name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to cancel message: {}", e);
            QueueError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }
}
