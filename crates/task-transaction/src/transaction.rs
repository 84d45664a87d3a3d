//! # Transaction
//!
//! A node collecting pending operations for later collective awaiting.
//!
//! ## State Machine
//!
//! ```text
//!            end()                 children closed,
//!   Open ───────────▶ Ending ───── own operations drained ───▶ Closed
//!    │  (non-root: after the owning task finished)                │
//!    └── add / wait allowed                    completion resolved ┘
//! ```
//!
//! ## Nesting
//!
//! Every operation added to a transaction gets a child transaction bound to the
//! operation's task. Work the operation defers is added to that child, and the
//! parent closes its children before draining its own operations. A non-root
//! transaction never drains before its owning task has finished.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::Location;
use std::sync::{Arc, Weak};

use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use crate::context::{self, ContextGuard};
use crate::domain::{TransactionError, TransactionId, TransactionState, Value};
use crate::metrics;
use crate::registry::Registry;
use crate::runtime::{self, gather, Signal, TaskHandle, TaskRef};

/// Result of draining a transaction: operation values in addition order, or
/// the first failure.
pub type Outcome = Result<Vec<Value>, TransactionError>;

type Callback = Box<dyn FnOnce(&TaskRef) + Send + 'static>;

struct Inner {
    id: Option<TransactionId>,
    state: TransactionState,
    close_started: bool,
    leaked: bool,
    owner: Option<TaskRef>,
    pending: Vec<TaskRef>,
    children: Vec<Arc<Transaction>>,
    parent: Option<Weak<Transaction>>,
    registry: Option<Arc<Registry>>,
}

/// Deferred work collected under one task.
pub struct Transaction {
    inner: Mutex<Inner>,
    has_parent: bool,
    completion: Signal<Outcome>,
    origin: &'static Location<'static>,
}

impl Transaction {
    fn new(
        registry: Arc<Registry>,
        parent: Option<&Arc<Transaction>>,
        origin: &'static Location<'static>,
    ) -> Arc<Self> {
        metrics::record_transaction_begun();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                id: None,
                state: TransactionState::Open,
                close_started: false,
                leaked: false,
                owner: None,
                pending: Vec::new(),
                children: Vec::new(),
                parent: parent.map(Arc::downgrade),
                registry: Some(registry),
            }),
            has_parent: parent.is_some(),
            completion: Signal::new(),
            origin,
        })
    }

    #[track_caller]
    pub(crate) fn begin_in(
        registry: &Arc<Registry>,
        owner: Option<&TaskRef>,
        parent: Option<&Arc<Transaction>>,
    ) -> Arc<Self> {
        let txn = Self::new(Arc::clone(registry), parent, Location::caller());
        match owner.cloned().or_else(TaskRef::current) {
            Some(task) => {
                if let Err(err) = txn.bind(&task) {
                    error!(registry = registry.name(), error = %err, "Failed to bind new transaction");
                }
            }
            None => warn!(
                registry = registry.name(),
                origin = %txn.origin,
                "Task not found at creation time, will be searched again later"
            ),
        }
        debug!(
            registry = registry.name(),
            txn = %TransactionId::label(txn.id()),
            parent = %TransactionId::label(parent.and_then(|p| p.id())),
            "Beginning transaction"
        );
        txn
    }

    /// Bind to `task`: assign the id, register on the task's stack and watch
    /// the task for completion.
    pub fn bind(self: &Arc<Self>, task: &TaskRef) -> Result<TransactionId, TransactionError> {
        let id = {
            let mut inner = self.inner.lock();
            if let Some(id) = inner.id {
                return Err(TransactionError::DuplicateBinding { id });
            }
            let Some(registry) = inner.registry.clone() else {
                return Err(TransactionError::ClosedTransaction { state: inner.state });
            };
            let slot = registry.push(task.id(), Arc::clone(self));
            let id = TransactionId::new(task.id(), slot);
            inner.id = Some(id);
            inner.owner = Some(task.clone());
            id
        };

        task.watch(self, |task, txn| Self::owner_finished(&txn, task));
        trace!(txn = %id, "Transaction bound to its task");
        Ok(id)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Identity, once bound.
    pub fn id(&self) -> Option<TransactionId> {
        self.inner.lock().id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Whether this transaction was begun without a parent.
    pub fn is_root(&self) -> bool {
        !self.has_parent
    }

    /// The parent, while both are alive and this one is not closed.
    pub fn parent(&self) -> Option<Arc<Transaction>> {
        self.inner.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Transaction>> {
        self.inner.lock().children.clone()
    }

    /// Number of operations added and not yet drained.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether the owning task finished while work was still pending.
    pub fn is_leaked(&self) -> bool {
        self.inner.lock().leaked
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransactionState::Closed
    }

    /// The close outcome, once the transaction is closed.
    pub fn outcome(&self) -> Option<Outcome> {
        self.completion.get()
    }

    /// Source location of the `begin` or `add` that created this transaction.
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    // =========================================================================
    // ADDING OPERATIONS
    // =========================================================================

    /// Schedule `future` as an operation of this transaction.
    ///
    /// The operation gets a child transaction bound to its task before it
    /// starts running. Its error, if any, is re-raised when the transaction is
    /// drained.
    #[track_caller]
    pub fn add<F, T, E>(self: &Arc<Self>, future: F) -> Result<TaskHandle<T>, TransactionError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::any::Any + Send + Sync,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.schedule(future, None, Location::caller())
    }

    /// Like [`add`](Self::add), running `callback` once the operation finishes.
    #[track_caller]
    pub fn add_with_callback<F, T, E, C>(
        self: &Arc<Self>,
        future: F,
        callback: C,
    ) -> Result<TaskHandle<T>, TransactionError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::any::Any + Send + Sync,
        E: Into<anyhow::Error> + Send + 'static,
        C: FnOnce(&TaskRef) + Send + 'static,
    {
        self.schedule(future, Some(Box::new(callback)), Location::caller())
    }

    /// Add every future, in order.
    #[track_caller]
    pub fn add_all<I, F, T, E>(
        self: &Arc<Self>,
        futures: I,
    ) -> Result<Vec<TaskHandle<T>>, TransactionError>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::any::Any + Send + Sync,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let origin = Location::caller();
        futures
            .into_iter()
            .map(|future| self.schedule(future, None, origin))
            .collect()
    }

    /// Add an existing handle, such as a [`Deferred`](crate::Deferred) event.
    ///
    /// Adding a handle that is already pending is a no-op.
    #[track_caller]
    pub fn add_task(self: &Arc<Self>, task: &TaskRef) -> Result<TaskRef, TransactionError> {
        self.track(task, None, Location::caller())?;
        Ok(task.clone())
    }

    /// Like [`add_task`](Self::add_task), running `callback` once the handle
    /// completes. The callback is not attached when the handle is already
    /// pending.
    #[track_caller]
    pub fn add_task_with_callback<C>(
        self: &Arc<Self>,
        task: &TaskRef,
        callback: C,
    ) -> Result<TaskRef, TransactionError>
    where
        C: FnOnce(&TaskRef) + Send + 'static,
    {
        self.track(task, Some(Box::new(callback)), Location::caller())?;
        Ok(task.clone())
    }

    /// Add every future, then wait for all of them.
    ///
    /// Values come back in order; the first failure is returned instead. The
    /// operations stay pending on the transaction.
    pub async fn gather<I, F, T, E>(self: &Arc<Self>, futures: I) -> Result<Vec<Arc<T>>, TransactionError>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::any::Any + Send + Sync,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let handles = self.add_all(futures)?;
        try_join_all(handles.iter().map(TaskHandle::join)).await
    }

    fn schedule<F, T, E>(
        self: &Arc<Self>,
        future: F,
        callback: Option<Callback>,
        origin: &'static Location<'static>,
    ) -> Result<TaskHandle<T>, TransactionError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::any::Any + Send + Sync,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.ensure_accepting(&self.inner.lock())?;
        let launch = runtime::prepare(future)?;
        let handle = TaskHandle::new(launch.task().clone());
        self.track(launch.task(), callback, origin)?;
        launch.start();
        Ok(handle)
    }

    fn track(
        self: &Arc<Self>,
        task: &TaskRef,
        callback: Option<Callback>,
        origin: &'static Location<'static>,
    ) -> Result<(), TransactionError> {
        let id = {
            let mut inner = self.inner.lock();
            self.ensure_accepting(&inner)?;
            if inner.pending.iter().any(|pending| pending.id() == task.id()) {
                trace!(task = %task.id(), "Operation already pending");
                return Ok(());
            }
            let Some(registry) = inner.registry.clone() else {
                return Err(TransactionError::ClosedTransaction { state: inner.state });
            };
            let child = Self::new(registry, Some(self), origin);
            child.bind(task)?;
            inner.children.push(child);
            inner.pending.push(task.clone());
            inner.id
        };

        if let Some(callback) = callback {
            task.add_done_callback(callback);
        }
        metrics::record_operations_added(1);
        trace!(txn = %TransactionId::label(id), task = %task.id(), "Operation added");
        Ok(())
    }

    fn ensure_accepting(&self, inner: &Inner) -> Result<(), TransactionError> {
        if inner.state != TransactionState::Open || inner.registry.is_none() {
            return Err(TransactionError::ClosedTransaction { state: inner.state });
        }
        if inner.id.is_none() && !context::contains(self) {
            return Err(TransactionError::UnboundTransaction);
        }
        Ok(())
    }

    // =========================================================================
    // DRAINING AND CLOSING
    // =========================================================================

    /// Take the pending operations without closing.
    ///
    /// Await the returned [`Drain`] for the values in addition order or the
    /// first failure. Fails unless the transaction is open.
    pub fn wait(&self) -> Result<Drain, TransactionError> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Open {
            return Err(TransactionError::ClosedTransaction { state: inner.state });
        }
        let tasks = std::mem::take(&mut inner.pending);
        if !tasks.is_empty() {
            debug!(
                txn = %TransactionId::label(inner.id),
                operations = tasks.len(),
                "Waiting for this transaction's operations to complete"
            );
        }
        Ok(Drain { tasks })
    }

    /// Close the transaction and return its outcome.
    ///
    /// The first call starts the close; every call, concurrent or later,
    /// resolves to the same outcome. The close keeps running if the caller
    /// stops polling.
    pub fn end(self: &Arc<Self>) -> BoxFuture<'static, Outcome> {
        let this = Arc::clone(self);
        async move {
            if this.start_close() {
                let closer = Arc::clone(&this);
                match Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(closer.close());
                    }
                    Err(_) => closer.close().await,
                }
            }
            this.completion.wait().await
        }
        .boxed()
    }

    fn start_close(&self) -> bool {
        let mut inner = self.inner.lock();
        !std::mem::replace(&mut inner.close_started, true)
    }

    async fn close(self: Arc<Self>) {
        let id = self.id();
        let label = TransactionId::label(id);

        let owner = if self.has_parent {
            self.inner.lock().owner.clone()
        } else {
            None
        };
        if let Some(owner) = owner {
            trace!(txn = %label, "Waiting for the owning task to finish");
            // Resolves only after every done-callback of the owner has run.
            let _ = owner.wait().await;
        }

        let children = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Ending;
            inner.children.clone()
        };
        debug!(txn = %label, children = children.len(), "Ending transaction");

        let child_failure = join_all(children.iter().map(|child| child.end()))
            .await
            .into_iter()
            .find_map(Result::err);

        let pending = std::mem::take(&mut self.inner.lock().pending);
        let drained = gather(&pending).await;

        let mut outcome = match (drained, child_failure) {
            (Err(err), _) | (Ok(_), Some(err)) => Err(err),
            (Ok(values), None) => Ok(values),
        };

        let registry = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Closed;
            inner.children.clear();
            inner.pending.clear();
            inner.parent = None;
            inner.owner = None;
            inner.registry.take()
        };
        if let (Some(id), Some(registry)) = (id, registry) {
            if let Err(fault) = registry.remove(id, &self) {
                error!(registry = registry.name(), txn = %id, error = %fault, "Registry fault while closing");
                outcome = Err(fault);
            }
        }

        metrics::record_transaction_closed(outcome.is_err());
        match &outcome {
            Ok(values) => debug!(txn = %label, values = values.len(), "Transaction closed"),
            Err(err) => debug!(txn = %label, error = %err, "Transaction closed with an error"),
        }
        self.completion.resolve(outcome);
    }

    /// Finalization: runs once the owning task is done, however it ended.
    fn owner_finished(txn: &Arc<Self>, task: &TaskRef) {
        trace!(task = %task.id(), txn = %TransactionId::label(txn.id()), "Owning task finished");
        let (id, pending, registry) = {
            let mut inner = txn.inner.lock();
            let leaked = inner.state == TransactionState::Open
                && !inner.close_started
                && !inner.pending.is_empty();
            if !leaked {
                return;
            }
            inner.leaked = true;
            (inner.id, inner.pending.len(), inner.registry.clone())
        };

        metrics::record_leak(txn.is_root());
        let label = TransactionId::label(id);
        if !txn.is_root() {
            warn!(
                txn = %label,
                pending,
                origin = %txn.origin,
                "A transaction has not been closed, but it has a parent"
            );
            return;
        }

        error!(txn = %label, pending, origin = %txn.origin, "A root transaction has not been closed");
        if let (Some(id), Some(registry)) = (id, registry) {
            registry.record_fault(TransactionError::LeakedRootTransaction { id, pending });
        }
    }

    // =========================================================================
    // SCOPES
    // =========================================================================

    /// Make this transaction current for synchronous code on this thread.
    ///
    /// This is how an unbound transaction accepts operations.
    pub fn enter(self: &Arc<Self>) -> ContextGuard {
        ContextGuard::enter(Arc::clone(self))
    }

    /// Run `body` with this transaction bound to the ambient task, closing it
    /// when `body` succeeds.
    ///
    /// On failure the transaction is left open and the error is returned.
    pub async fn scope<F, T, E>(self: &Arc<Self>, body: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        if self.id().is_none() {
            let task = TaskRef::current().ok_or(TransactionError::NoOwningTask)?;
            self.bind(&task)?;
        }
        match body.await {
            Ok(value) => {
                self.end().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(txn = %TransactionId::label(self.id()), error = %err, "An error happened on scope exit");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (id, state, pending, children) = {
            let inner = self.inner.lock();
            (inner.id, inner.state, inner.pending.len(), inner.children.len())
        };
        f.debug_struct("Transaction")
            .field("id", &id)
            .field("state", &state)
            .field("root", &self.is_root())
            .field("pending", &pending)
            .field("children", &children)
            .finish()
    }
}

/// Operations taken out of a transaction by [`Transaction::wait`].
#[must_use = "operations are only awaited when the drain is awaited"]
pub struct Drain {
    tasks: Vec<TaskRef>,
}

impl Drain {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskRef] {
        &self.tasks
    }
}

impl IntoFuture for Drain {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        async move { gather(&self.tasks).await }.boxed()
    }
}
