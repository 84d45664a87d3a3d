//! # Fallback Context Stack
//!
//! Answers "which transaction am I part of" for synchronous code that runs
//! outside any task: completion callbacks, top-level code before the runtime is
//! driven, or tasks spawned directly on tokio.
//!
//! A transaction is pushed by [`Transaction::enter`] and popped when the returned
//! guard drops. The guard is `!Send` and cannot be held across an `.await`, so
//! the stack is kept per thread: every scope opens and closes on the thread that
//! is running it.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, error};

use crate::domain::TransactionId;
use crate::transaction::Transaction;

thread_local! {
    static FALLBACK: RefCell<Vec<Arc<Transaction>>> = const { RefCell::new(Vec::new()) };
}

/// Most recently entered transaction on this thread.
pub(crate) fn current() -> Option<Arc<Transaction>> {
    FALLBACK.with(|stack| stack.borrow().last().cloned())
}

/// Whether `txn` is entered anywhere on this thread's stack.
pub(crate) fn contains(txn: &Transaction) -> bool {
    FALLBACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|entry| std::ptr::eq(Arc::as_ptr(entry), txn))
    })
}

/// Number of transactions entered on this thread.
pub fn depth() -> usize {
    FALLBACK.with(|stack| stack.borrow().len())
}

fn push(txn: Arc<Transaction>) {
    FALLBACK.with(|stack| stack.borrow_mut().push(txn));
}

fn pop(txn: &Arc<Transaction>) {
    FALLBACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last() {
            Some(top) if Arc::ptr_eq(top, txn) => {
                stack.pop();
            }
            _ => {
                error!(
                    txn = %TransactionId::label(txn.id()),
                    "Scoped transaction is not on top of the context stack"
                );
                stack.retain(|entry| !Arc::ptr_eq(entry, txn));
            }
        }
    });
}

/// Keeps a transaction on this thread's fallback stack until dropped.
#[must_use = "the transaction leaves the context as soon as the guard is dropped"]
pub struct ContextGuard {
    txn: Arc<Transaction>,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub(crate) fn enter(txn: Arc<Transaction>) -> Self {
        push(Arc::clone(&txn));
        Self {
            txn,
            _not_send: PhantomData,
        }
    }

    /// The scoped transaction.
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            debug!(
                txn = %TransactionId::label(self.txn.id()),
                "Leaving transaction scope while unwinding"
            );
        }
        pop(&self.txn);
    }
}
