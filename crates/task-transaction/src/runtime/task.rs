//! # Task Handles
//!
//! A thin layer over tokio that gives every scheduled piece of work an identity,
//! a completion slot and ordered done-callbacks.
//!
//! ## Completion Order
//!
//! ```text
//! future finishes ──▶ outcome stored ──▶ done-callbacks run ──▶ waiters wake
//!                                         (no ambient task)
//! ```
//!
//! Callbacks always run before anyone awaiting the handle resumes, so a
//! callback attached to an added operation fires before the transaction that
//! drains it resolves.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures::future::{try_join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, trace};

use crate::domain::{TaskId, TransactionError, Value};

tokio::task_local! {
    static CURRENT_TASK: Option<TaskRef>;
}

/// Outcome of a finished task.
pub type Completion = Result<Value, TransactionError>;

type DoneCallback = Box<dyn FnOnce(&TaskRef) + Send + 'static>;

struct Registered {
    /// Set for watchers: the entry is pruned once its target is dropped.
    target: Option<Weak<dyn Any + Send + Sync>>,
    callback: DoneCallback,
}

impl Registered {
    fn is_live(&self) -> bool {
        self.target
            .as_ref()
            .map_or(true, |target| target.strong_count() > 0)
    }
}

/// Where a handle's completion comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A future scheduled on the tokio runtime.
    Spawned,
    /// An event resolved from outside any task.
    Deferred,
}

struct TaskState {
    outcome: Option<Completion>,
    callbacks: Vec<Registered>,
}

struct TaskShared {
    id: TaskId,
    kind: TaskKind,
    state: Mutex<TaskState>,
    done: watch::Sender<bool>,
}

/// Type-erased, clonable handle to a scheduled task or deferred event.
#[derive(Clone)]
pub struct TaskRef {
    shared: Arc<TaskShared>,
}

impl TaskRef {
    fn new(kind: TaskKind) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(TaskShared {
                id: TaskId::next(),
                kind,
                state: Mutex::new(TaskState {
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                done,
            }),
        }
    }

    /// The task currently executing, if it was started by [`spawn`].
    ///
    /// Returns `None` outside any task, inside tasks spawned directly on tokio,
    /// and inside done-callbacks.
    pub fn current() -> Option<TaskRef> {
        CURRENT_TASK.try_with(Clone::clone).ok().flatten()
    }

    /// Identity of this handle.
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// How this handle completes.
    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    /// Whether an outcome is available.
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// The outcome, once the task has finished.
    pub fn outcome(&self) -> Option<Completion> {
        self.shared.state.lock().outcome.clone()
    }

    /// Whether both handles refer to the same task.
    pub fn ptr_eq(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `callback` once the task finishes.
    ///
    /// Callbacks fire in registration order. A callback added after completion
    /// runs immediately on the calling thread.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&TaskRef) + Send + 'static,
    {
        self.register(None, Box::new(callback));
    }

    /// Run `callback` with `target` once the task finishes, unless `target`
    /// has been dropped by then.
    ///
    /// Entries whose target is gone are pruned on every registration, so a
    /// long-lived task watched by many short-lived objects stays bounded.
    pub(crate) fn watch<T, F>(&self, target: &Arc<T>, callback: F)
    where
        T: Any + Send + Sync,
        F: FnOnce(&TaskRef, Arc<T>) + Send + 'static,
    {
        let weak = Arc::downgrade(target);
        let liveness: Weak<dyn Any + Send + Sync> = weak.clone();
        self.register(
            Some(liveness),
            Box::new(move |task: &TaskRef| match weak.upgrade() {
                Some(target) => callback(task, target),
                None => trace!(task = %task.id(), "Watched object dropped before the task finished"),
            }),
        );
    }

    fn register(&self, target: Option<Weak<dyn Any + Send + Sync>>, callback: DoneCallback) {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            if target.is_some() {
                state.callbacks.retain(Registered::is_live);
            }
            state.callbacks.push(Registered { target, callback });
            return;
        }
        drop(state);
        self.run_callback(callback);
    }

    #[cfg(test)]
    pub(crate) fn callbacks_len(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Wait for the task to finish.
    pub async fn wait(&self) -> Completion {
        let mut done = self.shared.done.subscribe();
        // The sender is owned by `self.shared`, so this cannot observe a closed channel.
        let _ = done.wait_for(|finished| *finished).await;
        self.outcome()
            .unwrap_or_else(|| Err(TransactionError::OperationCancelled { task: self.id() }))
    }

    /// Store the outcome, run callbacks, then wake waiters.
    ///
    /// Returns `false` if the task had already completed.
    pub(crate) fn complete(&self, outcome: Completion) -> bool {
        let callbacks = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.callbacks)
        };

        trace!(task = %self.id(), callbacks = callbacks.len(), "Task completed");
        for registered in callbacks {
            self.run_callback(registered.callback);
        }
        self.shared.done.send_replace(true);
        true
    }

    fn run_callback(&self, callback: DoneCallback) {
        let result = CURRENT_TASK.sync_scope(None, || {
            panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
        });
        if result.is_err() {
            error!(task = %self.id(), "Done callback panicked");
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Typed view of a [`TaskRef`] returned by [`spawn`] and `Transaction::add`.
pub struct TaskHandle<T> {
    task: TaskRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self {
            task,
            _marker: PhantomData,
        }
    }

    /// The untyped handle.
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Identity of the task.
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Whether the task has finished.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }
}

impl<T: Any + Send + Sync> TaskHandle<T> {
    /// Wait for the task and return its value.
    pub async fn join(&self) -> Result<Arc<T>, TransactionError> {
        let value = self.task.wait().await?;
        value
            .downcast::<T>()
            .ok_or(TransactionError::TypeMismatch { task: self.id() })
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self::new(self.task.clone())
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.task).finish()
    }
}

/// An event resolved from outside any task, with a handle identity.
///
/// Adding `Deferred::task()` to a transaction gives the eventual completion
/// callbacks a transaction of their own (see `Registry::get` with an explicit
/// owner).
#[derive(Debug, Clone)]
pub struct Deferred {
    task: TaskRef,
}

impl Deferred {
    /// Create an unresolved event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            task: TaskRef::new(TaskKind::Deferred),
        }
    }

    /// Handle to add to transactions or attach callbacks to.
    pub fn task(&self) -> TaskRef {
        self.task.clone()
    }

    /// Resolve with a value. Returns `false` if already resolved.
    pub fn resolve<T: Any + Send + Sync>(&self, value: T) -> bool {
        self.task.complete(Ok(Value::new(value)))
    }

    /// Resolve with an error. Returns `false` if already resolved.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> bool {
        self.task
            .complete(Err(TransactionError::operation(error.into())))
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

/// A future with its handle allocated but not yet scheduled.
///
/// Lets callers register bookkeeping against the handle before the future
/// can observe it.
pub(crate) struct Launch {
    task: TaskRef,
    future: BoxFuture<'static, Completion>,
    runtime: Handle,
}

impl Launch {
    pub(crate) fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Schedule the future on the runtime captured by [`prepare`].
    pub(crate) fn start(self) {
        let Launch {
            task,
            future,
            runtime,
        } = self;
        let inner = runtime.spawn(CURRENT_TASK.scope(Some(task.clone()), future));
        runtime.spawn(async move {
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    error!(task = %task.id(), "Operation panicked");
                    Err(TransactionError::OperationPanicked { task: task.id() })
                }
                Err(_) => Err(TransactionError::OperationCancelled { task: task.id() }),
            };
            task.complete(outcome);
        });
    }
}

/// Allocate a handle for `future` on the current runtime without scheduling it.
pub(crate) fn prepare<F, T, E>(future: F) -> Result<Launch, TransactionError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Any + Send + Sync,
    E: Into<anyhow::Error> + Send + 'static,
{
    let runtime = Handle::try_current().map_err(|_| TransactionError::NoRuntime)?;
    let future = async move {
        future
            .await
            .map(Value::new)
            .map_err(|e| TransactionError::operation(e.into()))
    }
    .boxed();
    Ok(Launch {
        task: TaskRef::new(TaskKind::Spawned),
        future,
        runtime,
    })
}

/// Schedule `future` on the current tokio runtime.
///
/// Inside the future, [`TaskRef::current`] returns the new handle, so
/// transactions begun there bind to it. Works from synchronous code as long as
/// a runtime context is entered.
pub fn spawn<F, T, E>(future: F) -> Result<TaskHandle<T>, TransactionError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Any + Send + Sync,
    E: Into<anyhow::Error> + Send + 'static,
{
    let launch = prepare(future)?;
    let handle = TaskHandle::new(launch.task().clone());
    launch.start();
    Ok(handle)
}

/// Wait for every task, returning values in order or the first error to occur.
pub async fn gather(tasks: &[TaskRef]) -> Result<Vec<Value>, TransactionError> {
    try_join_all(tasks.iter().map(TaskRef::wait)).await
}
