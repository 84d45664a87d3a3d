//! Integration scenarios across the task layer, registry and transactions.

pub mod leaks;
pub mod scenarios;

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared, ordered record of what happened during a scenario.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Install test logging once per process.
pub fn init() {
    transaction_telemetry::init_test_logging();
}
