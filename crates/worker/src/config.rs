// Worker process configuration
// Decision: DATABASE_URL is the only required variable; everything else has a default

use tenantflow_engine::EngineConfig;
use uuid::Uuid;

/// Error reading the worker configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Worker ID (unique identifier for this worker instance)
    pub worker_id: String,
    /// Maximum concurrent messages per queue
    pub max_concurrent_tasks: usize,
    /// Connection pool size
    pub database_max_connections: u32,
    /// Apply the engine's migrations on startup
    pub run_migrations: bool,
    /// Engine tunables (`WORKFLOW_*` variables)
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (required)
    /// - `WORKER_ID`: Worker identity (default: `worker-<uuid>`)
    /// - `MAX_CONCURRENT_TASKS`: Per-queue concurrency (default: 10)
    /// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `RUN_MIGRATIONS`: "false" to skip migrations (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.engine = EngineConfig::from_env();
        Ok(config)
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let worker_id = lookup("WORKER_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));

        let max_concurrent_tasks = parse(&lookup, "MAX_CONCURRENT_TASKS")?.unwrap_or(10);
        let database_max_connections = parse(&lookup, "DATABASE_MAX_CONNECTIONS")?.unwrap_or(10);

        let run_migrations = match lookup("RUN_MIGRATIONS") {
            None => true,
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "RUN_MIGRATIONS",
                        value,
                    })
                }
            },
        };

        Ok(Self {
            database_url,
            worker_id,
            max_concurrent_tasks,
            database_max_connections,
            run_migrations,
            engine: EngineConfig::default(),
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
