//! Queue consumers and background jobs
//!
//! This module provides:
//! - [`WorkerPool`] - Concurrent consumer of one queue
//! - [`QueuePoller`] - Batch receiving with exponential backoff
//! - [`PeriodicTask`] - Fixed-interval runner for [`PeriodicJob`]s
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkerPool<M>                              │
//! │  ┌─────────────┐                                             │
//! │  │ QueuePoller │  receive(batch, visibility timeout)         │
//! │  └──────┬──────┘                                             │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      MessageHandler<M> (Semaphore-limited)           │    │
//! │  │  [msg 1] [msg 2] ... [msg N]                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ Disposition                                        │
//! │         ▼                                                    │
//! │     ack / nack(delay) / dead_letter                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod periodic;
mod poller;
mod pool;

pub use periodic::{PeriodicJob, PeriodicTask};
pub use poller::{PollerConfig, PollerError, QueuePoller};
pub use pool::{
    Disposition, MessageHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
