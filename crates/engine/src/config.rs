//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::ScheduleSpec;
use crate::duration_serde::millis;
use crate::reliability::RetryPolicy;

/// Engine-wide configuration
///
/// Retry limits and batching windows are engine-wide; only retention is
/// overridable per tenant (see [`RetentionSettings`](crate::persistence::RetentionSettings)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries allowed after the first attempt of a step
    pub max_step_retries: u32,

    /// Base delay for exponential backoff
    #[serde(with = "millis")]
    pub backoff_base: Duration,

    /// Upper bound for a single backoff delay
    #[serde(with = "millis")]
    pub backoff_cap: Duration,

    /// Jitter factor (0.0-1.0) applied to backoff delays
    pub backoff_jitter: f64,

    /// Default days to keep execution log rows
    pub default_log_retention_days: u32,

    /// Default days to keep terminal executions
    pub default_execution_retention_days: u32,

    /// When the retention cleanup job runs
    pub cleanup_schedule: ScheduleSpec,

    /// How often scheduled triggers are evaluated
    #[serde(with = "millis")]
    pub poller_interval: Duration,

    /// Maximum trigger messages handled together
    pub trigger_batch_size: usize,

    /// How long the trigger consumer waits to fill a batch
    #[serde(with = "millis")]
    pub trigger_batch_window: Duration,

    /// Bound on a single action handler invocation
    #[serde(with = "millis")]
    pub action_timeout: Duration,

    /// Bound on a determinator's subject read
    #[serde(with = "millis")]
    pub determinator_timeout: Duration,

    /// Age after which an untouched execution is considered stalled
    #[serde(with = "millis")]
    pub stalled_threshold: Duration,

    /// Deliveries of one queue message before it is dead-lettered
    pub queue_max_receives: u32,

    /// How long a received message stays invisible to other consumers
    #[serde(with = "millis")]
    pub visibility_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            backoff_jitter: 0.0,
            default_log_retention_days: 90,
            default_execution_retention_days: 180,
            cleanup_schedule: ScheduleSpec::Daily { hour: 3, minute: 0 },
            poller_interval: Duration::from_secs(300),
            trigger_batch_size: 10,
            trigger_batch_window: Duration::from_secs(2),
            action_timeout: Duration::from_secs(60),
            determinator_timeout: Duration::from_secs(10),
            stalled_threshold: Duration::from_secs(600),
            queue_max_receives: 5,
            visibility_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults:
    /// - `WORKFLOW_MAX_STEP_RETRIES`
    /// - `WORKFLOW_BACKOFF_BASE_MS`, `WORKFLOW_BACKOFF_CAP_MS`
    /// - `WORKFLOW_LOG_RETENTION_DAYS`, `WORKFLOW_EXECUTION_RETENTION_DAYS`
    /// - `WORKFLOW_CLEANUP_HOUR_UTC`
    /// - `WORKFLOW_POLLER_INTERVAL_SECS`
    /// - `WORKFLOW_ACTION_TIMEOUT_MS`
    /// - `WORKFLOW_TRIGGER_BATCH_SIZE`, `WORKFLOW_TRIGGER_BATCH_WINDOW_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cleanup_schedule = match env_parse::<u32>("WORKFLOW_CLEANUP_HOUR_UTC") {
            Some(hour) if hour < 24 => ScheduleSpec::Daily { hour, minute: 0 },
            _ => defaults.cleanup_schedule.clone(),
        };

        Self {
            max_step_retries: env_parse("WORKFLOW_MAX_STEP_RETRIES")
                .unwrap_or(defaults.max_step_retries),
            backoff_base: env_parse("WORKFLOW_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: env_parse("WORKFLOW_BACKOFF_CAP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            default_log_retention_days: env_parse("WORKFLOW_LOG_RETENTION_DAYS")
                .unwrap_or(defaults.default_log_retention_days),
            default_execution_retention_days: env_parse("WORKFLOW_EXECUTION_RETENTION_DAYS")
                .unwrap_or(defaults.default_execution_retention_days),
            cleanup_schedule,
            poller_interval: env_parse("WORKFLOW_POLLER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poller_interval),
            action_timeout: env_parse("WORKFLOW_ACTION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.action_timeout),
            trigger_batch_size: env_parse::<usize>("WORKFLOW_TRIGGER_BATCH_SIZE")
                .map(|n| n.clamp(1, 10))
                .unwrap_or(defaults.trigger_batch_size),
            trigger_batch_window: env_parse("WORKFLOW_TRIGGER_BATCH_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.trigger_batch_window),
            ..defaults
        }
    }

    /// Set the retry limit
    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    /// Set backoff base and cap
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap.max(base);
        self
    }

    /// Set the action timeout
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Set default retention windows
    pub fn with_retention_days(mut self, log_days: u32, execution_days: u32) -> Self {
        self.default_log_retention_days = log_days;
        self.default_execution_retention_days = execution_days;
        self
    }

    /// Set the stalled-execution threshold
    pub fn with_stalled_threshold(mut self, threshold: Duration) -> Self {
        self.stalled_threshold = threshold;
        self
    }

    /// Retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_retries(self.max_step_retries)
            .with_base_delay(self.backoff_base)
            .with_max_delay(self.backoff_cap)
            .with_jitter(self.backoff_jitter)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
