//! # Transaction Metrics
//!
//! Prometheus metrics for monitoring transaction lifecycles and leaks.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! task-transaction = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `txn_transactions_begun_total` - Counter of transactions created
//! - `txn_transactions_closed_total` - Counter of transactions closed
//! - `txn_transactions_failed_total` - Counter of closes that resolved with an error
//! - `txn_operations_added_total` - Counter of operations added
//! - `txn_leaks_total` - Counter of leaked transactions (by kind: root, nested)

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

#[cfg(feature = "metrics")]
lazy_static! {
    /// Total transactions begun
    pub static ref TRANSACTIONS_BEGUN: IntCounter = register_int_counter!(
        "txn_transactions_begun_total",
        "Total number of transactions begun"
    )
    .expect("Failed to create TRANSACTIONS_BEGUN metric");

    /// Total transactions closed
    pub static ref TRANSACTIONS_CLOSED: IntCounter = register_int_counter!(
        "txn_transactions_closed_total",
        "Total number of transactions closed"
    )
    .expect("Failed to create TRANSACTIONS_CLOSED metric");

    /// Total closes that resolved with an error
    pub static ref TRANSACTIONS_FAILED: IntCounter = register_int_counter!(
        "txn_transactions_failed_total",
        "Total number of transaction closes that resolved with an error"
    )
    .expect("Failed to create TRANSACTIONS_FAILED metric");

    /// Total operations added
    pub static ref OPERATIONS_ADDED: IntCounter = register_int_counter!(
        "txn_operations_added_total",
        "Total number of operations added to transactions"
    )
    .expect("Failed to create OPERATIONS_ADDED metric");

    /// Leaked transactions, labeled by kind
    pub static ref LEAKS: IntCounterVec = register_int_counter_vec!(
        "txn_leaks_total",
        "Total number of transactions left open by their owning task",
        &["kind"]
    )
    .expect("Failed to create LEAKS metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

/// Register every transaction metric with the default prometheus registry so
/// they are exported before the first event.
#[cfg(feature = "metrics")]
pub fn register() {
    lazy_static::initialize(&TRANSACTIONS_BEGUN);
    lazy_static::initialize(&TRANSACTIONS_CLOSED);
    lazy_static::initialize(&TRANSACTIONS_FAILED);
    lazy_static::initialize(&OPERATIONS_ADDED);
    lazy_static::initialize(&LEAKS);
}

/// Record a transaction begun
#[cfg(feature = "metrics")]
pub fn record_transaction_begun() {
    TRANSACTIONS_BEGUN.inc();
}

/// Record a transaction closed
#[cfg(feature = "metrics")]
pub fn record_transaction_closed(failed: bool) {
    TRANSACTIONS_CLOSED.inc();
    if failed {
        TRANSACTIONS_FAILED.inc();
    }
}

/// Record operations added
#[cfg(feature = "metrics")]
pub fn record_operations_added(count: u64) {
    OPERATIONS_ADDED.inc_by(count);
}

/// Record a leaked transaction
#[cfg(feature = "metrics")]
pub fn record_leak(root: bool) {
    let kind = if root { "root" } else { "nested" };
    LEAKS.with_label_values(&[kind]).inc();
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn register() {}

#[cfg(not(feature = "metrics"))]
pub fn record_transaction_begun() {}

#[cfg(not(feature = "metrics"))]
pub fn record_transaction_closed(_failed: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_operations_added(_count: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_leak(_root: bool) {}
