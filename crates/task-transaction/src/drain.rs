//! # Drain-All
//!
//! Closes every root transaction of a registry and waits for them, typically at
//! shutdown. Roots still closing when the timeout elapses are reported as
//! pending and keep closing in the background; nothing is cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::domain::TransactionError;
use crate::registry::Registry;
use crate::transaction::Transaction;

/// What [`Registry::wait_all`] found.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Roots that finished closing, ordered by id.
    pub done: Vec<Arc<Transaction>>,
    /// Roots still closing when the timeout elapsed.
    pub pending: Vec<Arc<Transaction>>,
    /// Faults recorded since the last drain (leaked roots).
    pub faults: Vec<TransactionError>,
}

impl DrainReport {
    /// Close outcomes that are errors, in root order.
    pub fn failures(&self) -> Vec<TransactionError> {
        self.done
            .iter()
            .filter_map(|txn| txn.outcome().and_then(Result::err))
            .collect()
    }

    /// Every root closed successfully and nothing leaked.
    pub fn is_clean(&self) -> bool {
        self.pending.is_empty() && self.faults.is_empty() && self.failures().is_empty()
    }
}

impl Registry {
    /// Close every root transaction and wait for all of them.
    ///
    /// Returns `None` when there was nothing to close and no fault recorded.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> Option<DrainReport> {
        let roots = self.roots();
        if roots.is_empty() {
            let faults = self.take_faults();
            if faults.is_empty() {
                return None;
            }
            error!(registry = self.name(), faults = faults.len(), "Leaked root transactions");
            return Some(DrainReport {
                faults,
                ..DrainReport::default()
            });
        }

        info!(registry = self.name(), roots = roots.len(), "Closing root transactions");
        let closing = join_all(roots.iter().map(|txn| txn.end()));
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, closing).await.is_err() {
                    warn!(
                        registry = self.name(),
                        timeout_ms = saturating_millis(limit),
                        "Timed out waiting for root transactions"
                    );
                }
            }
            None => {
                closing.await;
            }
        }

        let (done, pending): (Vec<_>, Vec<_>) =
            roots.into_iter().partition(|txn| txn.outcome().is_some());
        let report = DrainReport {
            done,
            pending,
            faults: self.take_faults(),
        };

        if !report.faults.is_empty() {
            error!(registry = self.name(), faults = report.faults.len(), "Leaked root transactions");
        }
        debug!(
            registry = self.name(),
            done = report.done.len(),
            pending = report.pending.len(),
            failures = report.failures().len(),
            "Root transactions drained"
        );
        Some(report)
    }
}

/// Milliseconds for log fields, saturating instead of truncating.
fn saturating_millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}
