//! Queue polling with exponential backoff
//!
//! Receives message batches with adaptive polling intervals.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::duration_serde::millis;
use crate::queue::{Delivery, MessageQueue, QueueError, QueueMessage};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when messages are available)
    #[serde(with = "millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when the queue is empty
    pub backoff_multiplier: f64,

    /// Maximum messages to receive per poll
    pub batch_size: usize,

    /// How long a partial batch may keep filling after its first message
    #[serde(with = "millis")]
    pub batch_window: Duration,

    /// Invisibility granted to received messages
    #[serde(with = "millis")]
    pub visibility_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            batch_window: Duration::ZERO,
            visibility_timeout: Duration::from_secs(120),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the batch collection window
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Queue poller with adaptive backoff
///
/// Backs off exponentially while the queue is empty and resets to the
/// minimum interval as soon as messages arrive.
pub struct QueuePoller<M: QueueMessage> {
    queue: Arc<dyn MessageQueue<M>>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<M: QueueMessage> QueuePoller<M> {
    pub fn new(
        queue: Arc<dyn MessageQueue<M>>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Receive up to `max_messages`
    ///
    /// Once a message arrives the batch keeps filling for up to
    /// `batch_window`, so bursts are handed over together.
    #[instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn poll(&mut self, max_messages: usize) -> Result<Vec<Delivery<M>>, PollerError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_messages.min(self.config.batch_size);
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let mut batch = self
            .queue
            .receive(batch_size, self.config.visibility_timeout)
            .await?;

        if batch.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "Queue empty, backing off"
            );
            return Ok(batch);
        }

        let deadline = tokio::time::Instant::now() + self.config.batch_window;
        while batch.len() < batch_size
            && tokio::time::Instant::now() < deadline
            && !self.is_shutdown()
        {
            tokio::time::sleep(self.config.min_interval).await;
            let more = self
                .queue
                .receive(batch_size - batch.len(), self.config.visibility_timeout)
                .await?;
            batch.extend(more);
        }

        self.reset_backoff();
        debug!(count = batch.len(), "Received messages");
        Ok(batch)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
