//! Queue message shapes

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Anything that can travel through a [`MessageQueue`](super::MessageQueue)
pub trait QueueMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> QueueMessage for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Domain event published by an external service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessage {
    pub event_type: String,
    pub tenant_id: String,
    pub subject_record_id: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerMessage {
    pub fn new(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        subject_record_id: impl Into<String>,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            subject_record_id: subject_record_id.into(),
            payload,
            occurred_at,
        }
    }
}

/// Request to run one attempt of one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct StepMessage {
    pub execution_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
}

impl StepMessage {
    pub fn new(execution_id: Uuid, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            attempt,
        }
    }
}

/// A message that exhausted its retries: the original fields plus diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter<M> {
    #[serde(flatten)]
    pub message: M,
    pub failure_reason: String,
    pub attempt_count: u32,
}

/// A received message, invisible to other consumers until its visibility
/// timeout lapses
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub id: Uuid,
    pub message: M,

    /// Deliveries so far, including this one
    pub receive_count: u32,

    pub enqueued_at: DateTime<Utc>,
}
