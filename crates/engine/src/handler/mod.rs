//! External collaborator contracts
//!
//! Action steps call named [`StepHandler`]s looked up in a
//! [`HandlerRegistry`]. Determinators and scheduled triggers read the
//! subject domain through a [`SubjectSource`]. The engine has no knowledge
//! of what either does internally.

mod context;
mod definition;
mod registry;
mod subject;

pub use context::HandlerInvocation;
pub use definition::{FnHandler, HandlerError, StepHandler};
pub use registry::HandlerRegistry;
pub use subject::{InMemorySubjectSource, SubjectError, SubjectMatch, SubjectSource};
