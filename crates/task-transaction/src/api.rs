//! Module-level operations on the process-wide registry.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! let handle = task_transaction::spawn(async {
//!     let txn = task_transaction::begin(None);
//!     txn.add(async { anyhow::Ok(1) })?;
//!     txn.add(async { anyhow::Ok(2) })?;
//!     let values = task_transaction::end(None).await?;
//!     anyhow::Ok(values.len())
//! })?;
//! assert_eq!(*handle.join().await?, 2);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::domain::TransactionError;
use crate::drain::DrainReport;
use crate::registry::Registry;
use crate::runtime::TaskRef;
use crate::transaction::{Outcome, Transaction};

/// Begin a transaction owned by `owner`, or by the ambient task.
#[track_caller]
pub fn begin(owner: Option<&TaskRef>) -> Arc<Transaction> {
    Registry::global().begin(owner)
}

/// Current transaction, or `NoActiveTransaction`.
pub fn get(owner: Option<&TaskRef>) -> Result<Arc<Transaction>, TransactionError> {
    Registry::global().get(owner)
}

/// Current transaction, if any.
pub fn find(owner: Option<&TaskRef>) -> Option<Arc<Transaction>> {
    Registry::global().find(owner)
}

/// Close the current transaction.
pub async fn end(owner: Option<&TaskRef>) -> Outcome {
    Registry::global().end(owner).await
}

/// Drain the current transaction without closing it.
pub async fn wait(owner: Option<&TaskRef>) -> Outcome {
    Registry::global().wait(owner).await
}

/// Close every root transaction of the process-wide registry.
pub async fn wait_all(timeout: Option<Duration>) -> Option<DrainReport> {
    Registry::global().wait_all(timeout).await
}
