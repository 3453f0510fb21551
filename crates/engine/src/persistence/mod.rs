//! Persistence layer for the workflow engine
//!
//! This module provides:
//! - [`ExecutionStore`] trait for definitions, executions and step history
//! - [`InMemoryExecutionStore`] for testing
//! - [`PostgresExecutionStore`] for production

mod memory;
mod model;
mod postgres;
mod store;

pub use memory::InMemoryExecutionStore;
pub use model::{
    initial_context, EnrollOutcome, ExecutionLog, ExecutionStatus, ExecutionUpdate,
    ExpectedState, LogOutcome, NewExecution, PendingWake, RetentionSettings, ScheduledDefinition,
    WorkflowExecution,
};
pub use postgres::PostgresExecutionStore;
pub use store::{ExecutionStore, StoreError};
