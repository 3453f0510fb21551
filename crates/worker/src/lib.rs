//! Worker process for the tenant workflow engine
//!
//! Wires [`tenantflow_engine::WorkflowEngine`] to PostgreSQL and runs its
//! queue consumers and periodic jobs. Embed [`WorkerRuntime`] with your own
//! [`HandlerRegistry`](tenantflow_engine::HandlerRegistry) to run real
//! action handlers.

pub mod config;
pub mod runtime;
pub mod telemetry;

pub use config::{ConfigError, WorkerConfig};
pub use runtime::{builtin_handlers, WorkerRuntime};
pub use telemetry::{init_telemetry, TelemetryConfig};
