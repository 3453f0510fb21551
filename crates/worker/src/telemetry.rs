// Tracing initialisation for the worker binary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "debug", "tenantflow_engine=debug")
    pub log_filter: Option<String>,
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `RUST_LOG`: full filter directive
    /// - `LOG_LEVEL`: level for the tenantflow crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG").ok().or_else(|| {
                std::env::var("LOG_LEVEL")
                    .ok()
                    .map(|level| crate_filter(&level))
            }),
        }
    }

    /// The filter actually applied
    pub fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(crate_filter("info")))
    }
}

fn crate_filter(level: &str) -> String {
    format!("warn,tenantflow_engine={level},tenantflow_worker={level}")
}

/// Install the global subscriber; call once at startup
pub fn init_telemetry(config: &TelemetryConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(console_layer).init();
}
