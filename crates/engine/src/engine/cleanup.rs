//! Retention cleanup
//!
//! Deletes old step logs and old terminal executions per tenant. A tenant
//! that fails is logged and skipped; the others are still cleaned.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, instrument};

use super::error::EngineError;
use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::metrics::{Counter, EngineMetrics};
use crate::persistence::{ExecutionStore, StoreError};
use crate::worker::PeriodicJob;

/// Totals of one cleanup run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tenants: usize,
    pub logs_deleted: u64,
    pub executions_deleted: u64,
    pub failed_tenants: Vec<String>,
}

/// Daily retention job
pub struct RetentionCleanupJob {
    store: Arc<dyn ExecutionStore>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
    config: EngineConfig,
    last_slot: Mutex<Option<DateTime<Utc>>>,
}

impl RetentionCleanupJob {
    pub fn new(store: Arc<dyn ExecutionStore>, metrics: Arc<EngineMetrics>, config: EngineConfig) -> Self {
        Self {
            store,
            metrics,
            clock: system_clock(),
            config,
            last_slot: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Clean every tenant now
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<CleanupReport, EngineError> {
        let now = self.clock.now();
        let tenants = self.store.tenant_ids().await?;

        let mut report = CleanupReport {
            tenants: tenants.len(),
            ..Default::default()
        };

        for tenant_id in tenants {
            match self.clean_tenant(&tenant_id, now).await {
                Ok((logs, executions)) => {
                    report.logs_deleted += logs;
                    report.executions_deleted += executions;
                }
                Err(e) => {
                    error!(%tenant_id, error = %e, "retention cleanup failed for tenant");
                    report.failed_tenants.push(tenant_id);
                }
            }
        }

        info!(
            tenants = report.tenants,
            logs_deleted = report.logs_deleted,
            executions_deleted = report.executions_deleted,
            failed_tenants = report.failed_tenants.len(),
            "retention cleanup finished"
        );
        Ok(report)
    }

    /// Run if a new cleanup slot has started since the last run
    ///
    /// The first call only records the current slot, so a freshly started
    /// worker cleans at the next scheduled time rather than immediately.
    pub async fn run_if_due(&self) -> Result<Option<CleanupReport>, EngineError> {
        let Some(slot) = self.config.cleanup_schedule.current_slot(self.clock.now()) else {
            return Ok(None);
        };

        let due = {
            let mut last = self.last_slot.lock();
            match *last {
                Some(previous) if previous >= slot => false,
                Some(_) => {
                    *last = Some(slot);
                    true
                }
                None => {
                    *last = Some(slot);
                    false
                }
            }
        };

        if due {
            self.run_once().await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn clean_tenant(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let (log_days, execution_days) = self
            .store
            .get_retention(tenant_id)
            .await?
            .resolve(&self.config);

        let logs = match retention_cutoff(now, log_days) {
            Some(cutoff) => self.store.delete_logs_before(tenant_id, cutoff).await?,
            None => 0,
        };
        let executions = match retention_cutoff(now, execution_days) {
            Some(cutoff) => {
                self.store
                    .delete_terminal_executions_before(tenant_id, cutoff)
                    .await?
            }
            None => 0,
        };

        self.metrics
            .add(tenant_id, Counter::CleanupLogsDeleted, logs);
        self.metrics
            .add(tenant_id, Counter::CleanupExecutionsDeleted, executions);
        Ok((logs, executions))
    }
}

/// `now - days`; `None` when that predates any representable time
fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
}

#[async_trait]
impl PeriodicJob for RetentionCleanupJob {
    fn name(&self) -> &'static str {
        "retention-cleanup"
    }

    async fn tick(&self) -> Result<(), EngineError> {
        self.run_if_due().await.map(|_| ())
    }
}
