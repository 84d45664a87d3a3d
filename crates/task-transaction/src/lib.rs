//! # Task Transactions
//!
//! Collects deferred asynchronous work under the task that scheduled it, so the
//! work can be awaited as a unit later, typically before a response is sent or
//! at shutdown.
//!
//! ## Model
//!
//! ```text
//!   task A ── begin() ──▶ Ta (root)
//!                          ├── add(op1) ──▶ child bound to op1's task
//!                          └── add(op2) ──▶ child bound to op2's task
//!                                             └── op2 defers more work here
//!
//!   end(Ta): close children (each after its task finished), drain op1, op2
//!            ──▶ [v1, v2]  or the first error
//! ```
//!
//! - Transactions are bound to the task that began them and looked up through
//!   a [`Registry`]. Code running outside any task uses a scoped fallback
//!   ([`Transaction::enter`]).
//! - Operation errors surface when the transaction is drained, never when the
//!   operation is added.
//! - A task that finishes with undrained work leaks its transaction: nested
//!   leaks are logged, root leaks are recorded as faults and reported by
//!   [`Registry::wait_all`].
//!
//! ## Crate Layout
//!
//! - [`runtime`]: task handles over tokio (`spawn`, `Deferred`, `gather`)
//! - [`registry`]: per-task stacks of open transactions
//! - [`transaction`]: begin, add, wait, end and finalization
//! - [`context`]: synchronous fallback scope
//! - [`drain`]: closing every root at once

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod api;
pub mod config;
pub mod context;
pub mod domain;
pub mod drain;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod transaction;

// Re-export main types
pub use api::{begin, end, find, get, wait, wait_all};
pub use config::RegistryConfig;
pub use context::ContextGuard;
pub use domain::{TaskId, TransactionError, TransactionId, TransactionState, Value};
pub use drain::DrainReport;
pub use registry::Registry;
pub use runtime::{gather, spawn, Deferred, TaskHandle, TaskKind, TaskRef};
pub use transaction::{Drain, Outcome, Transaction};
