//! # Tenant Workflow Engine
//!
//! A multi-tenant engine that runs tenant-defined, multi-step automations
//! ("when X happens to a record, do A, wait N days, check B, then do C").
//!
//! ## Features
//!
//! - **Event and schedule triggers**: domain events and periodic subject
//!   queries enroll records, guarded by an idempotency key
//! - **Three step kinds**: actions call registered handlers, waits park the
//!   execution on a durable timer, determinators branch on fresh record data
//! - **Optimistic writes**: every state change is a compare-and-set on the
//!   execution's status, step and attempt, so duplicate deliveries are no-ops
//! - **Retries and dead letters**: capped exponential backoff, then a
//!   dead-letter queue whose consumer finalises the execution as failed
//! - **Retention**: per-tenant cleanup of step history and old executions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  TriggerProcessor · StepExecutor · FailureProcessor          │
//! │  RetentionCleanupJob · ScheduledTriggerPoller · Sweeper      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (PostgreSQL: definitions, executions, execution logs)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 MessageQueue + WorkerPool                    │
//! │  (triggers, steps and their dead-letter queues)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tenantflow_engine::prelude::*;
//!
//! let engine = WorkflowEngine::builder()
//!     .with_handler("send_email", FnHandler::new(|inv: HandlerInvocation| async move {
//!         Ok::<_, HandlerError>(json!({ "sent_to": inv.subject_record_id }))
//!     }))
//!     .build();
//!
//! engine.define(WorkflowDefinition::new(
//!     "acme",
//!     "booking follow-up",
//!     TriggerSpec::Event { event_type: "booking.created".into(), filter: None },
//!     vec![
//!         StepDefinition::action("confirm", "send_email", json!({})).then("pause"),
//!         StepDefinition::wait("pause", WaitSpec::duration(Duration::from_secs(3 * 86_400)))
//!             .then("feedback"),
//!         StepDefinition::action("feedback", "send_email", json!({})),
//!     ],
//! )).await?;
//!
//! engine.start()?;
//! ```

pub mod clock;
pub mod config;
pub mod definition;
pub mod engine;
pub mod handler;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;

pub(crate) mod duration_serde;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{system_clock, Clock, ManualClock, SharedClock};
    pub use crate::config::EngineConfig;
    pub use crate::definition::{
        Predicate, ScheduleSpec, StepDefinition, SubjectQuery, TriggerSpec, WaitSpec,
        WorkflowDefinition,
    };
    pub use crate::engine::{EngineError, EngineQueues, WorkflowEngine, WorkflowEngineBuilder};
    pub use crate::handler::{
        FnHandler, HandlerError, HandlerInvocation, HandlerRegistry, InMemorySubjectSource,
        StepHandler, SubjectMatch, SubjectSource,
    };
    pub use crate::persistence::{
        ExecutionLog, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, LogOutcome,
        PostgresExecutionStore, StoreError, WorkflowExecution,
    };
    pub use crate::queue::{MessageQueue, StepMessage, TriggerMessage};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SharedClock};
pub use config::EngineConfig;
pub use definition::{StepDefinition, TriggerSpec, WaitSpec, WorkflowDefinition};
pub use engine::{EngineError, EngineQueues, WorkflowEngine, WorkflowEngineBuilder};
pub use handler::{HandlerError, HandlerInvocation, HandlerRegistry, StepHandler};
pub use persistence::{
    ExecutionStatus, ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError,
    WorkflowExecution,
};
pub use queue::{StepMessage, TriggerMessage};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
