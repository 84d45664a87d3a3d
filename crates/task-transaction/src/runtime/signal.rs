//! Single-resolution slot.
//!
//! Backs a transaction's completion signal. Only the first `resolve` wins;
//! every waiter, early or late, observes that value.

use tokio::sync::watch;

/// A value that is resolved at most once and can be awaited by many.
#[derive(Debug)]
pub struct Signal<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> Signal<T> {
    /// Create an unresolved signal.
    #[must_use]
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Resolve the signal. Returns `false` if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// Current value, if resolved.
    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Whether the signal has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait until resolved and return the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            // The sender lives in `self`, so `changed` only fails once we are gone.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
