mod common;

use backtest_core::kv::KeyValueStore;
use backtest_core::queue::{EnqueueOptions, QueueError};
use backtest_core::types::JobState;
use common::{harness, payload_for, sample_backtest};

#[tokio::test]
async fn enqueue_rejects_duplicate_nonterminal_jobs() {
    let h = harness(10).await;
    let backtest = sample_backtest("bt-dup");
    let payload = payload_for(&backtest);

    h.queue
        .enqueue("bt-dup", &payload, EnqueueOptions::default())
        .await
        .unwrap();
    let err = h
        .queue
        .enqueue("bt-dup", &payload, EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::Duplicate {
            state: JobState::Waiting,
            ..
        }
    ));
    assert_eq!(h.queue.open_job_count().await.unwrap(), 1);
}

#[tokio::test]
async fn terminal_leftovers_are_replaced_on_enqueue() {
    let h = harness(10).await;
    let backtest = sample_backtest("bt-left");
    let payload = payload_for(&backtest);

    h.queue
        .enqueue("bt-left", &payload, EnqueueOptions::default())
        .await
        .unwrap();
    let lease = h.queue.try_lease().await.unwrap().expect("lease");
    lease.fail(Some("boom")).await.unwrap();

    // Failed row is retained, but does not occupy the key.
    let job = h.queue.get_job("bt-left").await.unwrap().expect("job row");
    assert_eq!(job.state, JobState::Failed);
    h.queue
        .enqueue("bt-left", &payload, EnqueueOptions::default())
        .await
        .unwrap();
    let job = h.queue.get_job("bt-left").await.unwrap().expect("job row");
    assert_eq!(job.state, JobState::Waiting);
}

#[tokio::test]
async fn leases_are_fifo_and_exclusive() {
    let h = harness(10).await;
    for id in ["bt-a", "bt-b"] {
        let backtest = sample_backtest(id);
        h.queue
            .enqueue(id, &payload_for(&backtest), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let first = h.queue.try_lease().await.unwrap().expect("first lease");
    assert_eq!(first.job().id, "bt-a");
    assert_eq!(first.job().state, JobState::Active);

    // The lock key exists while the lease is held.
    assert!(h.kv.get(&h.lock_key("bt-a")).await.unwrap().is_some());

    first.complete().await.unwrap();
    assert!(h.kv.get(&h.lock_key("bt-a")).await.unwrap().is_none());
    assert!(h.queue.get_job("bt-a").await.unwrap().is_none());

    let second = h.queue.try_lease().await.unwrap().expect("second lease");
    assert_eq!(second.job().id, "bt-b");
    second.complete().await.unwrap();

    assert!(h.queue.try_lease().await.unwrap().is_none());
}

#[tokio::test]
async fn remove_refuses_locked_jobs_and_force_remove_breaks_the_lock() {
    let h = harness(10).await;
    let backtest = sample_backtest("bt-stale");
    h.queue
        .enqueue("bt-stale", &payload_for(&backtest), EnqueueOptions::default())
        .await
        .unwrap();

    // Simulate a dead worker: the job went active and the process died with
    // the lock key still in the KV store.
    let lease = h.queue.try_lease().await.unwrap().expect("lease");
    drop(lease);
    assert_eq!(
        h.queue.get_job("bt-stale").await.unwrap().unwrap().state,
        JobState::Active
    );

    let err = h.queue.remove("bt-stale").await.unwrap_err();
    assert!(matches!(err, QueueError::Locked { .. }));

    h.queue.force_remove("bt-stale").await.unwrap();
    assert!(h.queue.get_job("bt-stale").await.unwrap().is_none());
    assert!(h.kv.get(&h.lock_key("bt-stale")).await.unwrap().is_none());
}

#[tokio::test]
async fn force_remove_of_missing_job_is_a_no_op() {
    let h = harness(10).await;
    h.queue.force_remove("bt-ghost").await.unwrap();
}

#[tokio::test]
async fn failed_rows_are_retained_up_to_the_configured_count() {
    let h = harness(10).await;
    for id in ["bt-f1", "bt-f2", "bt-f3"] {
        let backtest = sample_backtest(id);
        h.queue
            .enqueue(
                id,
                &payload_for(&backtest),
                EnqueueOptions {
                    remove_on_fail: 2,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        let lease = h.queue.try_lease().await.unwrap().expect("lease");
        lease.fail(Some("synthetic failure")).await.unwrap();
    }

    let mut failed = Vec::new();
    for id in ["bt-f1", "bt-f2", "bt-f3"] {
        if let Some(job) = h.queue.get_job(id).await.unwrap() {
            assert_eq!(job.state, JobState::Failed);
            failed.push(id);
        }
    }
    assert_eq!(failed.len(), 2, "retention keeps the newest two");
    assert!(!failed.contains(&"bt-f1"));
}

#[tokio::test]
async fn delayed_jobs_wait_until_due() {
    let h = harness(10).await;
    let backtest = sample_backtest("bt-delay");
    h.queue
        .enqueue(
            "bt-delay",
            &payload_for(&backtest),
            EnqueueOptions {
                delay: Some(std::time::Duration::from_millis(40)),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(h.queue.try_lease().await.unwrap().is_none());
    assert_eq!(
        h.queue.get_job("bt-delay").await.unwrap().unwrap().state,
        JobState::Delayed
    );

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let lease = h.queue.try_lease().await.unwrap().expect("due job");
    assert_eq!(lease.job().id, "bt-delay");
    lease.complete().await.unwrap();
}
