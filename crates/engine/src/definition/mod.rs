//! Workflow definition model
//!
//! This module contains the tenant-facing vocabulary:
//! - [`WorkflowDefinition`] and its [`StepDefinition`]s
//! - [`TriggerSpec`] for event-driven and scheduled enrollment
//! - [`Predicate`] for trigger filters and determinator branches
//! - [`ScheduleSpec`] for time-based triggers and periodic jobs

mod predicate;
mod schedule;
mod workflow;

pub use predicate::{resolve_path, value_as_timestamp, Predicate};
pub use schedule::ScheduleSpec;
pub use workflow::{
    DefinitionError, StepDefinition, StepKind, SubjectQuery, TriggerSpec, WaitSpec,
    WorkflowDefinition,
};
