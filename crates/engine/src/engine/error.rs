//! Engine error type

use uuid::Uuid;

use crate::definition::DefinitionError;
use crate::handler::SubjectError;
use crate::persistence::StoreError;
use crate::queue::{QueueError, SchedulerError};

/// Errors from engine components
///
/// Execution-level failures (handler errors, stale messages, conflicts)
/// are reported as outcomes, not errors. An `EngineError` means the
/// message could not be processed at all and should be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Delay scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Subject source error
    #[error("subject source error: {0}")]
    Subject(#[from] SubjectError),

    /// Definition rejected
    #[error("invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

impl EngineError {
    /// Whether redelivering the message may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => matches!(e, StoreError::Database(_) | StoreError::ConcurrencyConflict { .. }),
            Self::Queue(_) | Self::Scheduler(_) => true,
            Self::Subject(e) => matches!(e, SubjectError::Unavailable(_)),
            Self::Definition(_) | Self::ExecutionNotFound(_) => false,
        }
    }
}
