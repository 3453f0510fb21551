//! Subject domain access
//!
//! Determinator steps read a snapshot of the enrolled subject record and
//! the scheduled poller runs named queries against the subject domain.
//! Both go through [`SubjectSource`], which the embedding service provides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::SubjectQuery;

/// Errors reading the subject domain
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SubjectError {
    /// The subject domain could not be reached; worth retrying
    #[error("subject source unavailable: {0}")]
    Unavailable(String),

    /// The query name is not known to this source
    #[error("unknown subject query: {0}")]
    UnknownQuery(String),
}

/// One subject returned by a scheduled query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectMatch {
    pub subject_record_id: String,

    /// Becomes the synthetic event payload of the enrollment
    #[serde(default)]
    pub payload: Value,
}

impl SubjectMatch {
    pub fn new(subject_record_id: impl Into<String>, payload: Value) -> Self {
        Self {
            subject_record_id: subject_record_id.into(),
            payload,
        }
    }
}

/// Read access to subject records
#[async_trait]
pub trait SubjectSource: Send + Sync + 'static {
    /// Current snapshot of a subject record
    ///
    /// `Ok(None)` means the record no longer exists.
    async fn snapshot(
        &self,
        tenant_id: &str,
        subject_record_id: &str,
    ) -> Result<Option<Value>, SubjectError>;

    /// Subjects matching a scheduled trigger's query at `now`
    async fn query(
        &self,
        tenant_id: &str,
        query: &SubjectQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubjectMatch>, SubjectError>;
}

/// In-memory subject source
///
/// Useful for testing and for embedding services that push subject data
/// into the worker process.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubjectSource {
    records: Arc<RwLock<HashMap<(String, String), Value>>>,
    queries: Arc<RwLock<HashMap<(String, String), Vec<SubjectMatch>>>>,
}

impl InMemorySubjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subject record
    pub fn insert(&self, tenant_id: &str, subject_record_id: &str, record: Value) {
        self.records
            .write()
            .insert((tenant_id.to_string(), subject_record_id.to_string()), record);
    }

    /// Delete a subject record
    pub fn remove(&self, tenant_id: &str, subject_record_id: &str) {
        self.records
            .write()
            .remove(&(tenant_id.to_string(), subject_record_id.to_string()));
    }

    /// Set the result of a named query for a tenant
    pub fn set_query_results(&self, tenant_id: &str, query_name: &str, matches: Vec<SubjectMatch>) {
        self.queries
            .write()
            .insert((tenant_id.to_string(), query_name.to_string()), matches);
    }
}

#[async_trait]
impl SubjectSource for InMemorySubjectSource {
    async fn snapshot(
        &self,
        tenant_id: &str,
        subject_record_id: &str,
    ) -> Result<Option<Value>, SubjectError> {
        Ok(self
            .records
            .read()
            .get(&(tenant_id.to_string(), subject_record_id.to_string()))
            .cloned())
    }

    async fn query(
        &self,
        tenant_id: &str,
        query: &SubjectQuery,
        _now: DateTime<Utc>,
    ) -> Result<Vec<SubjectMatch>, SubjectError> {
        self.queries
            .read()
            .get(&(tenant_id.to_string(), query.name.clone()))
            .cloned()
            .ok_or_else(|| SubjectError::UnknownQuery(query.name.clone()))
    }
}
