//! # Transaction Telemetry
//!
//! Logging and metrics setup for services built on task transactions.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use transaction_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("Failed to init telemetry");
//!
//!     // Transaction lifecycles, leaks and faults are now logged and counted
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TXN_SERVICE_NAME` | `task-transaction` | Service name in the startup log |
//! | `TXN_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also accepted) |
//! | `TXN_CONSOLE_OUTPUT` | `true` | Print logs to stdout |
//! | `TXN_JSON_LOGS` | `false` | JSON log lines (default `true` in containers) |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging, init_test_logging};
pub use metrics::{encode_metrics, register_metrics, MetricsHandle, METRIC_PREFIX};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register the transaction metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first so counters exist before the first transaction is logged
    let metrics = register_metrics()?;
    init_logging(&config)?;

    Ok(TelemetryGuard {
        service_name: config.service_name,
        metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
    metrics: MetricsHandle,
}

impl TelemetryGuard {
    /// Metrics handle for exposition.
    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry...");
    }
}
