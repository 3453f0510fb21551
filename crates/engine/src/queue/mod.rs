//! Queues and durable timers
//!
//! Four logical queues carry the engine's traffic:
//! [`TRIGGER_QUEUE`], [`STEP_QUEUE`] and their dead-letter queues.
//! The [`DelayScheduler`] parks step messages on the step queue until
//! their wake time.

mod memory;
mod message;
mod postgres;
#[allow(clippy::module_inception)]
mod queue;
mod scheduler;

pub use memory::InMemoryQueue;
pub use message::{DeadLetter, Delivery, QueueMessage, StepMessage, TriggerMessage};
pub use postgres::PostgresQueue;
pub use queue::{MessageQueue, NackOutcome, QueueError};
pub use scheduler::{DelayScheduler, QueueDelayScheduler, ScheduleHandle, SchedulerError};

/// Domain events awaiting enrollment
pub const TRIGGER_QUEUE: &str = "workflow-triggers";

/// Trigger messages that exhausted their redeliveries
pub const TRIGGER_DLQ: &str = "workflow-triggers-dlq";

/// Step attempts awaiting execution (including parked wake-ups)
pub const STEP_QUEUE: &str = "workflow-steps";

/// Step messages that exhausted their retries
pub const STEP_DLQ: &str = "workflow-steps-dlq";
