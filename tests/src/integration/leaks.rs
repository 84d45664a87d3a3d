//! # Leaked Transactions
//!
//! A task that finishes while its transaction still holds undrained work
//! leaks it. Nested leaks are only logged since the parent still drains the
//! work; root leaks are recorded as registry faults.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use task_transaction::{spawn, Deferred, Registry, TransactionError};

    use crate::integration::{init, EventLog};

    /// Spawn a task that begins a root transaction, stashes `event`, and
    /// returns without closing it.
    async fn leak_root(registry: &Arc<Registry>, event: &Deferred) {
        let reg = Arc::clone(registry);
        let pending = event.task();
        let owner = spawn(async move {
            let txn = reg.begin(None);
            txn.add_task(&pending)?;
            anyhow::Ok(())
        })
        .unwrap();
        owner.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_closed_root_is_drained_by_wait_all() {
        init();
        let registry = Registry::new();
        let log = EventLog::new();
        let reg = Arc::clone(&registry);
        let op_log = log.clone();

        let owner = spawn(async move {
            let txn = reg.begin(None);
            txn.add(async move {
                op_log.push("called stashed");
                anyhow::Ok(())
            })?;
            anyhow::Ok(())
        })
        .unwrap();
        owner.join().await.unwrap();

        let report = registry.wait_all(None).await.unwrap();
        assert_eq!(report.done.len(), 1);
        assert!(report.pending.is_empty());
        assert!(report.failures().is_empty());
        assert_eq!(report.faults.len(), 1);
        assert!(!report.is_clean());
        assert_eq!(log.len(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_root_leak_is_a_fault() {
        init();
        let registry = Registry::new();
        let event = Deferred::new();
        leak_root(&registry, &event).await;

        let faults = registry.take_faults();
        assert!(matches!(
            faults.as_slice(),
            [TransactionError::LeakedRootTransaction { pending: 1, .. }]
        ));

        let root = registry.roots().pop().unwrap();
        assert!(root.is_leaked());
        event.resolve(());
        assert_eq!(root.end().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_all_timeout_surfaces_pending_roots() {
        init();
        let registry = Registry::new();
        let event = Deferred::new();
        leak_root(&registry, &event).await;

        let report = registry
            .wait_all(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(report.done.is_empty());
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.faults.len(), 1);

        // Still closing in the background.
        let root = Arc::clone(&report.pending[0]);
        event.resolve(());
        root.end().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_nested_leak_error_reaches_the_root() {
        init();
        let registry = Registry::new();
        let root = registry.begin(Some(&Deferred::new().task()));
        let reg = Arc::clone(&registry);

        let op = root
            .add(async move {
                reg.get(None)?.add(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<(), _>(anyhow::anyhow!("late failure"))
                })?;
                anyhow::Ok(reg.get(None)?)
            })
            .unwrap();

        let child = op.join().await.unwrap();
        assert!(child.is_leaked());
        assert!(registry.take_faults().is_empty());

        let err = root.end().await.unwrap_err();
        assert!(err.is_operation_failure());
        assert_eq!(
            err.operation_error().map(ToString::to_string),
            Some("late failure".to_string())
        );
    }

    #[tokio::test]
    async fn test_panicking_owner_still_finalizes() {
        init();
        let registry = Registry::new();
        let event = Deferred::new();
        let reg = Arc::clone(&registry);
        let pending = event.task();

        let owner = spawn(async move {
            let txn = reg.begin(None);
            txn.add_task(&pending)?;
            if txn.pending_len() > 0 {
                panic!("owner gave up");
            }
            anyhow::Ok(())
        })
        .unwrap();

        assert!(matches!(
            owner.join().await,
            Err(TransactionError::OperationPanicked { .. })
        ));
        assert_eq!(registry.take_faults().len(), 1);

        event.resolve(());
        let report = registry.wait_all(None).await.unwrap();
        assert_eq!(report.done.len(), 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_closed_transactions_do_not_leak() {
        init();
        let registry = Registry::new();
        let reg = Arc::clone(&registry);

        let owner = spawn(async move {
            let txn = reg.begin(None);
            txn.add(async { anyhow::Ok(()) })?;
            txn.end().await?;
            anyhow::Ok(txn)
        })
        .unwrap();

        let txn = owner.join().await.unwrap();
        assert!(!txn.is_leaked());
        assert!(registry.take_faults().is_empty());
        assert!(registry.wait_all(None).await.is_none());
    }
}
