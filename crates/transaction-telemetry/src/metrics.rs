//! Prometheus exposition of transaction metrics.
//!
//! All transaction metrics follow the naming convention `txn_<metric>_<unit>`
//! and live in the default prometheus registry.

use prometheus::{Encoder, TextEncoder};

use crate::TelemetryError;

/// Prefix shared by every transaction metric.
pub const METRIC_PREFIX: &str = "txn_";

/// Handle returned once the transaction metrics are registered.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    prefix: &'static str,
}

impl MetricsHandle {
    /// Encode the transaction metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, TelemetryError> {
        encode_metrics(self.prefix)
    }
}

/// Register all transaction metrics with the default registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    task_transaction::metrics::register();
    let registered = prometheus::gather()
        .iter()
        .any(|family| family.get_name().starts_with(METRIC_PREFIX));
    if !registered {
        return Err(TelemetryError::MetricsInit(
            "transaction metrics are missing from the default registry".to_string(),
        ));
    }
    Ok(MetricsHandle {
        prefix: METRIC_PREFIX,
    })
}

/// Encode every metric family whose name starts with `prefix`.
pub fn encode_metrics(prefix: &str) -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families: Vec<_> = prometheus::gather()
        .into_iter()
        .filter(|family| family.get_name().starts_with(prefix))
        .collect();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
