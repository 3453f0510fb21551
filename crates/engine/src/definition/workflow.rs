//! Workflow definitions
//!
//! A definition is an ordered list of steps linked by `next_step_id` or by a
//! determinator's branch targets. The first step is the single root. Stored
//! definitions are immutable: editing one produces a new `version`, and
//! executions keep the version they were enrolled with.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::predicate::{resolve_path, value_as_timestamp, Predicate};
use super::schedule::ScheduleSpec;

/// Error for malformed definitions
///
/// Every variant is permanent: retrying an execution bound to a broken
/// definition cannot succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow has no steps")]
    NoSteps,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{from}' references unknown step '{target}'")]
    UnknownStep { from: String, target: String },

    #[error("determinator step '{0}' must not declare next_step_id")]
    DeterminatorWithNext(String),

    #[error("wait step '{0}' has no next step to resume")]
    TrailingWait(String),

    #[error("action step '{0}' has no handler name")]
    MissingHandler(String),

    #[error("step '{0}' is part of a cycle")]
    Cycle(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("step '{0}' not found in definition")]
    StepNotFound(String),

    #[error("wait step '{step_id}' could not resolve its wake time: {reason}")]
    UnresolvableWait { step_id: String, reason: String },
}

/// How an execution gets enrolled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Enroll when a matching domain event arrives
    Event {
        event_type: String,
        /// Predicate over the event payload; absent means "every event"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Predicate>,
    },

    /// Enroll every subject returned by `query` each time the schedule is due
    Schedule {
        schedule: ScheduleSpec,
        query: SubjectQuery,
    },
}

/// Named query against the subject domain, resolved by a
/// [`SubjectSource`](crate::handler::SubjectSource)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectQuery {
    /// Query name, e.g. `pets_with_expiring_vaccination`
    pub name: String,

    /// Query parameters, e.g. `{"within_days": 7}`
    #[serde(default)]
    pub params: Value,
}

impl SubjectQuery {
    /// Create a query with parameters
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// How long a wait step pauses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WaitSpec {
    /// Fixed delay from the moment the wait starts
    For { duration_ms: u64 },

    /// Absolute time read from the execution context, shifted by `offset_ms`
    ///
    /// `path` is resolved against `{"context": <execution context>}` and
    /// must yield an RFC 3339 string or epoch milliseconds.
    Until {
        path: String,
        #[serde(default)]
        offset_ms: i64,
    },
}

impl WaitSpec {
    /// Wait a fixed duration
    pub fn duration(duration: std::time::Duration) -> Self {
        Self::For {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Compute the wake time for a wait starting at `now`
    pub fn wake_at(&self, now: DateTime<Utc>, context: &Value) -> Result<DateTime<Utc>, String> {
        match self {
            Self::For { duration_ms } => {
                let millis = i64::try_from(*duration_ms)
                    .map_err(|_| format!("duration {duration_ms}ms is out of range"))?;
                ChronoDuration::try_milliseconds(millis)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| format!("duration {duration_ms}ms is out of range"))
            }
            Self::Until { path, offset_ms } => {
                let scope = json!({ "context": context });
                let value = resolve_path(&scope, path)
                    .ok_or_else(|| format!("path '{path}' not found in context"))?;
                let base = value_as_timestamp(value)
                    .ok_or_else(|| format!("value at '{path}' is not a timestamp"))?;
                ChronoDuration::try_milliseconds(*offset_ms)
                    .and_then(|delta| base.checked_add_signed(delta))
                    .ok_or_else(|| format!("offset {offset_ms}ms is out of range"))
            }
        }
    }
}

/// Step-kind specific payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered handler
    Action {
        handler: String,
        #[serde(default)]
        params: Value,
    },

    /// Pause without holding any worker resources
    Wait { wait: WaitSpec },

    /// Branch on a predicate over `{"context": .., "subject": ..}`
    Determinator {
        predicate: Predicate,
        on_true: String,
        on_false: String,
    },
}

/// A single step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// Unique within the definition
    pub step_id: String,

    #[serde(flatten)]
    pub kind: StepKind,

    /// Successor for action and wait steps; absent means "complete"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

impl StepDefinition {
    /// Action step
    pub fn action(step_id: impl Into<String>, handler: impl Into<String>, params: Value) -> Self {
        Self {
            step_id: step_id.into(),
            kind: StepKind::Action {
                handler: handler.into(),
                params,
            },
            next_step_id: None,
        }
    }

    /// Wait step
    pub fn wait(step_id: impl Into<String>, wait: WaitSpec) -> Self {
        Self {
            step_id: step_id.into(),
            kind: StepKind::Wait { wait },
            next_step_id: None,
        }
    }

    /// Determinator step
    pub fn determinator(
        step_id: impl Into<String>,
        predicate: Predicate,
        on_true: impl Into<String>,
        on_false: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind: StepKind::Determinator {
                predicate,
                on_true: on_true.into(),
                on_false: on_false.into(),
            },
            next_step_id: None,
        }
    }

    /// Set the successor step
    pub fn then(mut self, next_step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(next_step_id.into());
        self
    }

    /// Kind name for logs
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Action { .. } => "action",
            StepKind::Wait { .. } => "wait",
            StepKind::Determinator { .. } => "determinator",
        }
    }

    fn successors(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::Determinator {
                on_true, on_false, ..
            } => vec![on_true.as_str(), on_false.as_str()],
            _ => self.next_step_id.as_deref().into_iter().collect(),
        }
    }
}

/// A tenant-owned automation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,

    /// Starts at 1; bumped by every stored edit
    pub version: i32,

    pub trigger: TriggerSpec,
    pub steps: Vec<StepDefinition>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create an active version-1 definition
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        trigger: TriggerSpec,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            version: 1,
            trigger,
            steps,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// The root step
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    /// Look up a step by id
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Whether a domain event of `event_type` with `payload` enrolls into this definition
    pub fn matches_event(&self, event_type: &str, payload: &Value) -> bool {
        match &self.trigger {
            TriggerSpec::Event {
                event_type: expected,
                filter,
            } => {
                expected == event_type
                    && filter.as_ref().map_or(true, |f| f.evaluate(payload))
            }
            TriggerSpec::Schedule { .. } => false,
        }
    }

    /// Check structural rules
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps);
        }

        if let TriggerSpec::Schedule { schedule, .. } = &self.trigger {
            schedule
                .validate()
                .map_err(DefinitionError::InvalidSchedule)?;
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.step_id.clone()));
            }
        }

        for step in &self.steps {
            match &step.kind {
                StepKind::Action { handler, .. } if handler.trim().is_empty() => {
                    return Err(DefinitionError::MissingHandler(step.step_id.clone()));
                }
                StepKind::Wait { .. } if step.next_step_id.is_none() => {
                    return Err(DefinitionError::TrailingWait(step.step_id.clone()));
                }
                StepKind::Determinator { .. } if step.next_step_id.is_some() => {
                    return Err(DefinitionError::DeterminatorWithNext(step.step_id.clone()));
                }
                _ => {}
            }

            for target in step.successors() {
                if !ids.contains(target) {
                    return Err(DefinitionError::UnknownStep {
                        from: step.step_id.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let by_id: HashMap<&str, &StepDefinition> = self
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s))
            .collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for root in &self.steps {
            if marks.contains_key(root.step_id.as_str()) {
                continue;
            }

            // Iterative DFS: (step, index of next successor to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root.step_id.as_str(), 0)];
            marks.insert(root.step_id.as_str(), Mark::Visiting);

            while let Some((id, idx)) = stack.pop() {
                let successors = by_id.get(id).map(|s| s.successors()).unwrap_or_default();
                if let Some(&next) = successors.get(idx) {
                    stack.push((id, idx + 1));
                    match marks.get(next) {
                        Some(Mark::Visiting) => {
                            return Err(DefinitionError::Cycle(next.to_string()));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next, Mark::Visiting);
                            stack.push((next, 0));
                        }
                    }
                } else {
                    marks.insert(id, Mark::Done);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn booking_reminder() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "tenant-a",
            "booking reminder",
            TriggerSpec::Event {
                event_type: "booking.created".into(),
                filter: Some(Predicate::equals("$.status", json!("confirmed"))),
            },
            vec![
                StepDefinition::action("confirm", "send_email", json!({"template": "confirm"}))
                    .then("pause"),
                StepDefinition::wait("pause", WaitSpec::duration(Duration::from_secs(3 * 86400)))
                    .then("remind"),
                StepDefinition::action("remind", "send_email", json!({"template": "remind"})),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        let def = booking_reminder();
        assert!(def.validate().is_ok());
        assert_eq!(def.first_step().unwrap().step_id, "confirm");
        assert_eq!(def.step("pause").unwrap().kind_name(), "wait");
    }

    #[test]
    fn test_matches_event_applies_filter() {
        let def = booking_reminder();
        assert!(def.matches_event("booking.created", &json!({"status": "confirmed"})));
        assert!(!def.matches_event("booking.created", &json!({"status": "pending"})));
        assert!(!def.matches_event("booking.cancelled", &json!({"status": "confirmed"})));
    }

    #[test]
    fn test_rejects_unknown_target() {
        let mut def = booking_reminder();
        def.steps[0].next_step_id = Some("nowhere".into());
        assert_eq!(
            def.validate(),
            Err(DefinitionError::UnknownStep {
                from: "confirm".into(),
                target: "nowhere".into()
            })
        );
    }

    #[test]
    fn test_rejects_trailing_wait() {
        let mut def = booking_reminder();
        def.steps.truncate(2);
        def.steps[1].next_step_id = None;
        assert_eq!(
            def.validate(),
            Err(DefinitionError::TrailingWait("pause".into()))
        );
    }

    #[test]
    fn test_rejects_cycle() {
        let mut def = booking_reminder();
        def.steps[2].next_step_id = Some("confirm".into());
        assert!(matches!(def.validate(), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn test_rejects_determinator_with_next() {
        let def = WorkflowDefinition::new(
            "tenant-a",
            "branch",
            TriggerSpec::Event {
                event_type: "x".into(),
                filter: None,
            },
            vec![
                StepDefinition::determinator("check", Predicate::exists("$.subject"), "a", "b")
                    .then("a"),
                StepDefinition::action("a", "log", Value::Null),
                StepDefinition::action("b", "log", Value::Null),
            ],
        );
        assert_eq!(
            def.validate(),
            Err(DefinitionError::DeterminatorWithNext("check".into()))
        );
    }

    #[test]
    fn test_branches_may_converge() {
        let def = WorkflowDefinition::new(
            "tenant-a",
            "branch",
            TriggerSpec::Event {
                event_type: "x".into(),
                filter: None,
            },
            vec![
                StepDefinition::determinator("check", Predicate::exists("$.subject"), "a", "b"),
                StepDefinition::action("a", "log", Value::Null).then("done"),
                StepDefinition::action("b", "log", Value::Null).then("done"),
                StepDefinition::action("done", "log", Value::Null),
            ],
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_wait_until_reads_context() {
        let wait = WaitSpec::Until {
            path: "$.context.event.payload.check_in".into(),
            offset_ms: -86_400_000,
        };
        let context = json!({"event": {"payload": {"check_in": "2026-05-10T12:00:00Z"}}});
        let wake = wait.wake_at(Utc::now(), &context).unwrap();
        assert_eq!(wake.to_rfc3339(), "2026-05-09T12:00:00+00:00");

        assert!(wait.wake_at(Utc::now(), &json!({})).is_err());
    }

    #[test]
    fn test_wait_offset_out_of_range_is_an_error() {
        let wait = WaitSpec::Until {
            path: "$.context.event.payload.check_in".into(),
            offset_ms: i64::MIN,
        };
        let context = json!({"event": {"payload": {"check_in": "2026-05-10T12:00:00Z"}}});
        let err = wait.wake_at(Utc::now(), &context).unwrap_err();
        assert!(err.contains("out of range"), "{err}");

        let wait = WaitSpec::For {
            duration_ms: u64::MAX,
        };
        assert!(wait.wake_at(Utc::now(), &context).is_err());
    }

    #[test]
    fn test_step_wire_format() {
        let step: StepDefinition = serde_json::from_value(json!({
            "step_id": "pause",
            "kind": "wait",
            "wait": {"for": {"duration_ms": 1000}},
            "next_step_id": "remind"
        }))
        .unwrap();

        assert_eq!(
            step,
            StepDefinition::wait("pause", WaitSpec::For { duration_ms: 1000 }).then("remind")
        );
    }
}
