//! # End-to-End Scenarios
//!
//! Usage patterns the library exists for: synchronous code deep inside a task
//! stashes async work on "the current transaction", and the task awaits all of
//! it at one point.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use task_transaction::{
        begin, end, find, gather, get, spawn, Deferred, Registry, TaskId, TaskRef, Transaction,
    };

    use crate::integration::{init, EventLog};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Synchronous helper that stashes work on whatever transaction is current.
    fn stash_work(log: &EventLog) -> anyhow::Result<()> {
        let txn = get(None)?;
        let log = log.clone();
        txn.add(async move {
            log.push("called stashed");
            anyhow::Ok(())
        })?;
        Ok(())
    }

    async fn numbered(n: i32) -> anyhow::Result<i32> {
        let txn = get(None)?;
        anyhow::ensure!(txn.parent().is_some(), "operation transaction has no parent");
        Ok(n)
    }

    fn stashed_result(task: &TaskRef) -> String {
        match task.outcome() {
            Some(Ok(value)) => value
                .downcast_ref::<&'static str>()
                .map_or_else(|| "unexpected type".to_string(), |s| s.to_string()),
            Some(Err(err)) => err.to_string(),
            None => "not finished".to_string(),
        }
    }

    /// Component that stashes work while being built and finishes its setup in
    /// a completion callback.
    struct Widget {
        log: EventLog,
    }

    impl Widget {
        fn build(log: EventLog) -> anyhow::Result<Arc<Self>> {
            let widget = Arc::new(Self { log });
            let txn = get(None)?;
            let op_log = widget.log.clone();
            let this = Arc::clone(&widget);
            txn.add_with_callback(
                async move {
                    op_log.push("called stashed");
                    anyhow::Ok("result from stashed")
                },
                move |task| this.on_ready(task),
            )?;
            Ok(widget)
        }

        fn on_ready(&self, task: &TaskRef) {
            self.log.push(stashed_result(task));
        }
    }

    // =============================================================================
    // PER-TASK TRANSACTIONS
    // =============================================================================

    #[tokio::test]
    async fn test_transaction_per_task() {
        init();
        let log = EventLog::new();

        let external = |log: EventLog| async move {
            let task = TaskRef::current().ok_or_else(|| anyhow!("not running in a task"))?;
            let txn = begin(None);
            stash_work(&log)?;
            txn.end().await?;
            anyhow::Ok(task.id())
        };

        let first = spawn(external(log.clone())).unwrap();
        let second = spawn(external(log.clone())).unwrap();
        let ids = gather(&[first.task().clone(), second.task().clone()])
            .await
            .unwrap();

        let ids: Vec<TaskId> = ids
            .iter()
            .map(|value| *value.downcast_ref::<TaskId>().unwrap())
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(log.entries(), vec!["called stashed", "called stashed"]);
    }

    #[tokio::test]
    async fn test_results_in_addition_order() {
        init();
        let handle = spawn(async {
            let txn = begin(None);
            txn.add(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::Ok(1_i32)
            })?;
            txn.add(async { anyhow::Ok(2_i32) })?;
            let values = txn.end().await?;
            anyhow::Ok(
                values
                    .iter()
                    .filter_map(|value| value.downcast_ref::<i32>().copied())
                    .collect::<Vec<_>>(),
            )
        })
        .unwrap();

        assert_eq!(*handle.join().await.unwrap(), vec![1, 2]);
    }

    // =============================================================================
    // CALLBACKS
    // =============================================================================

    #[tokio::test]
    async fn test_callback_runs_after_operation_and_before_end() {
        init();
        let log = EventLog::new();
        let task_log = log.clone();

        let handle = spawn(async move {
            let txn = begin(None);
            let op_log = task_log.clone();
            let cb_log = task_log.clone();
            txn.add_with_callback(
                async move {
                    op_log.push("called stashed");
                    anyhow::Ok("result from stashed")
                },
                move |task| cb_log.push(stashed_result(task)),
            )?;
            txn.end().await?;
            task_log.push("end resolved");
            anyhow::Ok(())
        })
        .unwrap();
        handle.join().await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["called stashed", "result from stashed", "end resolved"]
        );
    }

    #[tokio::test]
    async fn test_callback_bound_to_component() {
        init();
        let log = EventLog::new();
        let task_log = log.clone();

        let handle = spawn(async move {
            let txn = begin(None);
            let _widget = Widget::build(task_log)?;
            txn.end().await?;
            anyhow::Ok(())
        })
        .unwrap();
        handle.join().await.unwrap();

        assert_eq!(log.entries(), vec!["called stashed", "result from stashed"]);
    }

    // =============================================================================
    // OTHER TASKS AND EVENTS
    // =============================================================================

    #[tokio::test]
    async fn test_switch_to_other_task() {
        init();
        let log = EventLog::new();
        let task_log = log.clone();

        let handle = spawn(async move {
            let outer = begin(None);
            {
                let txn = get(None)?;
                anyhow::ensure!(Arc::ptr_eq(&txn, &outer), "lookup did not find the begun transaction");

                let expected_parent = Arc::clone(&outer);
                let async_log = task_log.clone();
                let another = spawn(async move {
                    async_log.push("on async");
                    let parent = get(None)?
                        .parent()
                        .ok_or_else(|| anyhow!("transaction has no parent"))?;
                    anyhow::ensure!(Arc::ptr_eq(&parent, &expected_parent), "wrong parent");
                    anyhow::Ok(())
                })?;
                task_log.push("on sync");
                txn.add_task(another.task())?;
            }
            end(None).await?;
            anyhow::Ok(())
        })
        .unwrap();
        handle.join().await.unwrap();

        assert_eq!(log.entries(), vec!["on sync", "on async"]);
    }

    #[tokio::test]
    async fn test_transaction_and_gather() {
        init();
        let handle = spawn(async {
            let txn = begin(None);
            let values = txn.gather([numbered(1), numbered(2)]).await?;
            txn.end().await?;
            anyhow::Ok(values.iter().map(|n| **n).collect::<Vec<i32>>())
        })
        .unwrap();

        assert_eq!(*handle.join().await.unwrap(), vec![1, 2]);
    }

    fn called_by_callback(log: &EventLog, master: &Arc<Transaction>) {
        let scoped_child = find(None)
            .and_then(|txn| txn.parent())
            .is_some_and(|parent| Arc::ptr_eq(&parent, master));
        log.push(format!("scoped child: {scoped_child}"));
    }

    #[tokio::test]
    async fn test_transaction_and_deferred_event() {
        init();
        let log = EventLog::new();
        let task_log = log.clone();

        let handle = spawn(async move {
            let master = begin(None);
            let event = Deferred::new();
            let event_task = event.task();

            let cb_master = Arc::clone(&master);
            let cb_log = task_log.clone();
            event_task.add_done_callback(move |task| {
                cb_log.push(format!("ambient: {}", find(None).is_some()));
                let Ok(txn) = get(Some(task)) else {
                    cb_log.push("no transaction for the event");
                    return;
                };
                let is_child = txn
                    .parent()
                    .is_some_and(|parent| Arc::ptr_eq(&parent, &cb_master));
                cb_log.push(format!("child of master: {is_child}"));

                let _scope = txn.enter();
                called_by_callback(&cb_log, &cb_master);
            });
            master.add_task(&event_task)?;

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                event.resolve("Time passed");
            });

            let values = master.end().await?;
            let resolved = values
                .first()
                .and_then(|value| value.downcast_ref::<&'static str>().copied());
            anyhow::Ok(resolved)
        })
        .unwrap();

        assert_eq!(*handle.join().await.unwrap(), Some("Time passed"));
        assert_eq!(
            log.entries(),
            vec!["ambient: false", "child of master: true", "scoped child: true"]
        );
    }

    // =============================================================================
    // OUTSIDE ANY TASK
    // =============================================================================

    #[test]
    fn test_calling_from_outside_any_task() {
        init();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let registry = Registry::new();
        let log = EventLog::new();

        let txn = {
            let _context = runtime.enter();
            let txn = registry.begin(None);
            assert!(txn.id().is_none());
            {
                let _scope = txn.enter();
                let current = registry.get(None).unwrap();
                let op_log = log.clone();
                current
                    .add(async move {
                        op_log.push("called stashed");
                        anyhow::Ok(())
                    })
                    .unwrap();
            }
            txn
        };

        assert!(log.is_empty());
        runtime.block_on(txn.end()).unwrap();
        assert_eq!(log.len(), 1);
        assert!(txn.is_closed());
    }
}
