//! # Handle Registry
//!
//! Maps task identities to the stack of transactions opened under each task.
//!
//! ```text
//! ┌──────────────────────────── Registry ────────────────────────────┐
//! │  task-1 ──▶ [ task-1#0 (root) , task-1#1 ]   ◀── top = current   │
//! │  task-7 ──▶ [ task-7#0 (child of task-1#0) ]                     │
//! │  task-9 ──▶ [ task-9#0 (child of task-7#0) ]                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//!
//! - Only binding pushes and only closing pops.
//! - A closing transaction must be on top of its own stack.
//! - An emptied stack is removed immediately.
//!
//! One registry is process-wide ([`Registry::global`]). Private registries keep
//! unrelated subsystems (or tests) from draining each other's work.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::context;
use crate::domain::{TaskId, TransactionError, TransactionId};
use crate::runtime::TaskRef;
use crate::transaction::{Outcome, Transaction};

lazy_static! {
    static ref GLOBAL: Arc<Registry> = Registry::with_config(RegistryConfig::from_env());
}

/// Process-wide bookkeeping of open transactions keyed by task identity.
pub struct Registry {
    config: RegistryConfig,
    stacks: Mutex<HashMap<TaskId, Vec<Arc<Transaction>>>>,
    faults: Mutex<VecDeque<TransactionError>>,
}

impl Registry {
    /// Create a private registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(RegistryConfig::named("local"))
    }

    /// Create a private registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stacks: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
        })
    }

    /// The process-wide registry used by the module-level functions.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registry label.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    // =========================================================================
    // BOOKKEEPING
    // =========================================================================

    /// Push `txn` on `task`'s stack and return its slot.
    pub(crate) fn push(&self, task: TaskId, txn: Arc<Transaction>) -> usize {
        let mut stacks = self.stacks.lock();
        let stack = stacks.entry(task).or_default();
        stack.push(txn);
        stack.len() - 1
    }

    /// Pop `txn` from the top of its stack.
    ///
    /// If `txn` is not on top the LIFO discipline was broken: the entry is
    /// removed anyway and the violation is returned as a fault.
    pub(crate) fn remove(
        &self,
        id: TransactionId,
        txn: &Transaction,
    ) -> Result<(), TransactionError> {
        let mut stacks = self.stacks.lock();
        let Some(stack) = stacks.get_mut(&id.task) else {
            return Err(TransactionError::RegistryInconsistency(format!(
                "no stack registered for {}",
                id.task
            )));
        };

        let on_top = stack
            .last()
            .is_some_and(|top| std::ptr::eq(Arc::as_ptr(top), txn));
        let fault = if on_top {
            stack.pop();
            None
        } else {
            let before = stack.len();
            stack.retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), txn));
            Some(if stack.len() == before {
                format!("{id} is not registered under {}", id.task)
            } else {
                format!("{id} was closed while not on top of its stack")
            })
        };

        if stack.is_empty() {
            stacks.remove(&id.task);
        }
        drop(stacks);

        match fault {
            Some(reason) => Err(TransactionError::RegistryInconsistency(reason)),
            None => Ok(()),
        }
    }

    /// Most recent transaction opened under `task`.
    pub fn top(&self, task: TaskId) -> Option<Arc<Transaction>> {
        self.stacks
            .lock()
            .get(&task)
            .and_then(|stack| stack.last().cloned())
    }

    /// Every transaction opened under `task`, oldest first.
    pub fn stack(&self, task: TaskId) -> Vec<Arc<Transaction>> {
        self.stacks.lock().get(&task).cloned().unwrap_or_default()
    }

    /// Registered transactions without a parent, ordered by id.
    pub fn roots(&self) -> Vec<Arc<Transaction>> {
        let registered: Vec<Arc<Transaction>> =
            self.stacks.lock().values().flatten().cloned().collect();
        let mut roots: Vec<Arc<Transaction>> =
            registered.into_iter().filter(|txn| txn.is_root()).collect();
        roots.sort_by_key(|txn| txn.id());
        roots
    }

    /// Number of registered transactions.
    pub fn len(&self) -> usize {
        self.stacks.lock().values().map(Vec::len).sum()
    }

    /// Whether no transaction is registered.
    pub fn is_empty(&self) -> bool {
        self.stacks.lock().is_empty()
    }

    /// Number of tasks with at least one registered transaction.
    pub fn task_count(&self) -> usize {
        self.stacks.lock().len()
    }

    pub(crate) fn record_fault(&self, fault: TransactionError) {
        let mut faults = self.faults.lock();
        if faults.len() >= self.config.max_faults.max(1) {
            faults.pop_front();
        }
        faults.push_back(fault);
    }

    /// Drain the recorded faults (root transactions leaked by their tasks).
    pub fn take_faults(&self) -> Vec<TransactionError> {
        self.faults.lock().drain(..).collect()
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Begin a transaction owned by `owner`, or by the ambient task.
    ///
    /// Without any task the transaction stays unbound and can only be used
    /// through [`Transaction::enter`].
    ///
    /// Binding watches the owner for completion. The watch is released once
    /// the transaction is dropped, so a long-lived task may begin and end
    /// transactions in a loop.
    #[track_caller]
    pub fn begin(self: &Arc<Self>, owner: Option<&TaskRef>) -> Arc<Transaction> {
        Transaction::begin_in(self, owner, None)
    }

    /// Begin a transaction nested under `parent`.
    #[track_caller]
    pub fn begin_with_parent(
        self: &Arc<Self>,
        owner: Option<&TaskRef>,
        parent: &Arc<Transaction>,
    ) -> Arc<Transaction> {
        Transaction::begin_in(self, owner, Some(parent))
    }

    /// Current transaction for `owner` (or the ambient task), falling back to
    /// the innermost synchronous scope.
    pub fn find(&self, owner: Option<&TaskRef>) -> Option<Arc<Transaction>> {
        let task = owner.cloned().or_else(TaskRef::current);
        task.and_then(|task| self.top(task.id()))
            .or_else(context::current)
    }

    /// Like [`find`](Self::find) but fails when nothing is active.
    pub fn get(&self, owner: Option<&TaskRef>) -> Result<Arc<Transaction>, TransactionError> {
        self.find(owner).ok_or_else(|| {
            let task = owner.cloned().or_else(TaskRef::current).map(|task| task.id());
            debug!(registry = self.name(), ?task, "No active transaction");
            TransactionError::NoActiveTransaction { task }
        })
    }

    /// Like [`find`](Self::find) but returns `default` when nothing is active.
    pub fn get_or(
        &self,
        default: Arc<Transaction>,
        owner: Option<&TaskRef>,
    ) -> Arc<Transaction> {
        self.find(owner).unwrap_or(default)
    }

    /// Close the current transaction.
    pub async fn end(&self, owner: Option<&TaskRef>) -> Outcome {
        let txn = self.get(owner)?;
        txn.end().await
    }

    /// Drain the current transaction without closing it.
    pub async fn wait(&self, owner: Option<&TaskRef>) -> Outcome {
        let txn = self.get(owner)?;
        let drain = txn.wait()?;
        drain.await
    }
}
