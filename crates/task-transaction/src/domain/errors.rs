//! Error types for task transactions
//!
//! Every failure the library reports belongs to one family, [`TransactionError`].
//! Errors raised by added operations are captured when the operation completes and
//! re-raised when the owning transaction is drained, never at `add` time.

use std::sync::Arc;

use thiserror::Error;

use super::value_objects::{TaskId, TransactionId, TransactionState};

/// All errors that can occur while working with transactions.
///
/// The type is `Clone` so one close outcome can be handed to every caller of
/// `end()`; operation errors are shared through an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// Binding needed an owning task but none was supplied or ambient.
    #[error("Unable to find the current task")]
    NoOwningTask,

    /// The transaction already has an id.
    #[error("Transaction {id} has an id already")]
    DuplicateBinding { id: TransactionId },

    /// Unbound transaction used outside of its synchronous scope.
    #[error("This transaction is not associated with any task")]
    UnboundTransaction,

    /// Operation attempted on a transaction that is no longer open.
    #[error("Cannot use a transaction in state {state}")]
    ClosedTransaction { state: TransactionState },

    /// Lookup found neither a task-bound nor a scoped transaction.
    #[error("There's no transaction begun for {}", describe_task(.task))]
    NoActiveTransaction { task: Option<TaskId> },

    /// A root transaction's owning task ended with work still pending.
    #[error("Root transaction {id} has not been closed: {pending} pending operation(s) left")]
    LeakedRootTransaction { id: TransactionId, pending: usize },

    /// The per-task stack did not have the closing transaction on top.
    #[error("Registry inconsistency: {0}")]
    RegistryInconsistency(String),

    /// An added operation returned an error.
    #[error("Operation failed: {0:#}")]
    Operation(Arc<anyhow::Error>),

    /// An added operation panicked.
    #[error("Operation {task} panicked")]
    OperationPanicked { task: TaskId },

    /// An added operation was cancelled by the runtime.
    #[error("Operation {task} was cancelled")]
    OperationCancelled { task: TaskId },

    /// A typed handle was joined but the value has another type.
    #[error("Operation {task} produced a value of an unexpected type")]
    TypeMismatch { task: TaskId },

    /// No tokio runtime is reachable from the calling context.
    #[error("No tokio runtime available to schedule the operation")]
    NoRuntime,
}

impl TransactionError {
    /// Wrap an error returned by an operation.
    ///
    /// A `TransactionError` travelling through an operation is unwrapped, so a
    /// nested failure keeps its own variant.
    pub fn operation(error: anyhow::Error) -> Self {
        match error.downcast::<TransactionError>() {
            Ok(inner) => inner,
            Err(other) => Self::Operation(Arc::new(other)),
        }
    }

    /// The error returned by a failed operation, if this is one.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Operation(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }

    /// Whether this error came from an added operation rather than the
    /// transaction machinery.
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::Operation(_) | Self::OperationPanicked { .. } | Self::OperationCancelled { .. }
        )
    }
}

fn describe_task(task: &Option<TaskId>) -> String {
    match task {
        Some(task) => task.to_string(),
        None => "the calling context".to_string(),
    }
}
