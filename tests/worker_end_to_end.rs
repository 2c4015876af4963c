mod common;

use backtest_core::checkpoint::{CheckpointEngine, CheckpointState};
use backtest_core::model::{Portfolio, ResultCounts};
use backtest_core::status::StatusEvent;
use backtest_core::types::{BacktestStatus, JobState};
use chrono::{Duration, Utc};
use common::{candle_groups, drain_events, harness, sample_backtest, USER};

#[tokio::test]
async fn happy_path_completes_with_exactly_three_checkpoints() {
    let h = harness(300).await;
    let backtest = sample_backtest("bt-happy");
    h.submit(&backtest).await;

    let mut rx = h.status.subscribe("bt-happy");
    assert_eq!(h.worker.drain().await.unwrap(), 1);

    let record = h.store.get("bt-happy").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert!(record.checkpoint.is_none());
    assert!(record.last_checkpoint_at.is_none());
    assert!(record.error_message.is_none());
    assert_eq!(record.processed_count, 300);
    assert_eq!(record.total_count, 300);

    // One snapshot row per checkpoint boundary: steps 100, 200, 300.
    let counts = h.store.result_counts("bt-happy").await.unwrap();
    assert_eq!(counts.snapshots, 3);
    assert_eq!(counts.trades, counts.fills);

    let events = drain_events(&mut rx);
    assert_eq!(
        events,
        vec![
            StatusEvent::Running,
            StatusEvent::Progress {
                fraction: 100.0 / 300.0,
                index: 99
            },
            StatusEvent::Progress {
                fraction: 200.0 / 300.0,
                index: 199
            },
            StatusEvent::Progress {
                fraction: 1.0,
                index: 299
            },
            StatusEvent::Completed,
        ]
    );

    // The job was removed on completion.
    assert!(h.queue.get_job("bt-happy").await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_step_checkpoints_regardless_of_modulus() {
    let h = harness(250).await;
    let backtest = sample_backtest("bt-250");
    h.submit(&backtest).await;
    h.worker.drain().await.unwrap();

    // Boundaries at 100 and 200, plus the terminal write at 250.
    let counts = h.store.result_counts("bt-250").await.unwrap();
    assert_eq!(counts.snapshots, 3);
    let record = h.store.get("bt-250").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert_eq!(record.processed_count, 250);
}

#[tokio::test]
async fn empty_dataset_completes_immediately() {
    let h = harness(0).await;
    let backtest = sample_backtest("bt-empty");
    h.submit(&backtest).await;
    h.worker.drain().await.unwrap();

    let record = h.store.get("bt-empty").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert_eq!(record.processed_count, 0);
    assert_eq!(record.total_count, 0);
    assert_eq!(h.store.result_counts("bt-empty").await.unwrap().snapshots, 0);
}

#[tokio::test]
async fn pause_at_boundary_then_resume_reproduces_the_uninterrupted_run() {
    let h = harness(300).await;

    // Reference: the same seed run without interruption.
    let reference = sample_backtest("bt-ref");
    h.submit(&reference).await;
    h.worker.drain().await.unwrap();
    let reference_trades = h.store.list_trades("bt-ref").await.unwrap();
    assert!(!reference_trades.is_empty(), "fixture should trade");

    let mut paused = sample_backtest("bt-paused");
    paused.seed = reference.seed.clone();
    h.submit(&paused).await;
    let mut rx = h.status.subscribe("bt-paused");

    // Flag set before the run: the worker honors it at the first checkpoint
    // boundary, not mid-step.
    let outcome = h.recovery.pause("bt-paused").await;
    assert!(outcome.success);
    h.worker.drain().await.unwrap();

    let record = h.store.get("bt-paused").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Paused);
    assert_eq!(record.processed_count, 100);
    let blob = record.checkpoint.as_ref().expect("checkpoint kept on pause");
    assert_eq!(blob.last_processed_index, 99);
    let events = drain_events(&mut rx);
    assert_eq!(
        events,
        vec![
            StatusEvent::Running,
            StatusEvent::Progress {
                fraction: 100.0 / 300.0,
                index: 99
            },
            StatusEvent::Paused,
        ]
    );

    // Resume: PENDING + queued event carrying the checkpoint position.
    h.recovery.resume(USER, "bt-paused").await.unwrap();
    let record = h.store.get("bt-paused").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Pending);
    let events = drain_events(&mut rx);
    assert_eq!(
        events,
        vec![StatusEvent::Queued {
            resumed: true,
            has_checkpoint: true,
            checkpoint_index: Some(99),
        }]
    );

    h.worker.drain().await.unwrap();
    let record = h.store.get("bt-paused").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert_eq!(record.processed_count, 300);

    // Byte-identical result sequence despite the interruption.
    let resumed_trades = h.store.list_trades("bt-paused").await.unwrap();
    assert_eq!(resumed_trades, reference_trades);
    let reference_signals = h.store.list_signals("bt-ref").await.unwrap();
    let resumed_signals = h.store.list_signals("bt-paused").await.unwrap();
    assert_eq!(resumed_signals, reference_signals);
}

#[tokio::test]
async fn crash_recovery_resumes_from_the_checkpoint_deterministically() {
    let h = harness(300).await;

    let reference = sample_backtest("bt-ref");
    h.submit(&reference).await;
    h.worker.drain().await.unwrap();
    let reference_trades = h.store.list_trades("bt-ref").await.unwrap();

    // Obtain a genuine step-100 checkpoint by pausing at the boundary.
    let mut crashed = sample_backtest("bt-crashed");
    crashed.seed = reference.seed.clone();
    h.submit(&crashed).await;
    h.recovery.pause("bt-crashed").await;
    h.worker.drain().await.unwrap();
    assert_eq!(
        h.store.get("bt-crashed").await.unwrap().unwrap().status,
        BacktestStatus::Paused
    );

    // Reconstruct the crash aftermath: the record says RUNNING, a stale
    // active job sits in the queue, and the dead worker's lock key is still
    // in the KV store.
    h.store
        .transition("bt-crashed", BacktestStatus::Running, None)
        .await
        .unwrap();
    h.enqueue(&crashed).await;
    let stale_lease = h.queue.try_lease().await.unwrap().expect("stale lease");
    assert_eq!(stale_lease.job().id, "bt-crashed");
    drop(stale_lease);

    let report = h.recovery.recover_orphaned().await.unwrap();
    assert_eq!(report.requeued, vec!["bt-crashed".to_string()]);

    let record = h.store.get("bt-crashed").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Pending);
    assert_eq!(record.config.auto_resume_count, 1);
    assert!(record.checkpoint.is_some(), "fresh checkpoint preserved");
    assert_eq!(record.processed_count, 100);

    // The worker restores from the step-100 checkpoint and finishes; the
    // output is identical to the uninterrupted run.
    assert_eq!(h.worker.drain().await.unwrap(), 1);
    let record = h.store.get("bt-crashed").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert_eq!(record.processed_count, 300);
    assert_eq!(
        h.store.list_trades("bt-crashed").await.unwrap(),
        reference_trades
    );
}

#[tokio::test]
async fn cancel_flag_is_honored_at_the_next_boundary() {
    let h = harness(300).await;
    let backtest = sample_backtest("bt-cancel");
    h.submit(&backtest).await;

    h.recovery.cancel("bt-cancel").await.unwrap();
    h.worker.drain().await.unwrap();

    let record = h.store.get("bt-cancel").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Canceled);
    assert_eq!(record.processed_count, 100);
}

#[tokio::test]
async fn algorithm_errors_fail_the_backtest_terminally() {
    let h = harness(50).await;
    let mut backtest = sample_backtest("bt-boom");
    backtest.algorithm_id = Some(common::FAILING_ALGORITHM.to_string());
    h.submit(&backtest).await;

    let mut rx = h.status.subscribe("bt-boom");
    h.worker.drain().await.unwrap();

    let record = h.store.get("bt-boom").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("division by zero"), "got: {message}");

    // The failed job row is retained for forensics.
    let job = h.queue.get_job("bt-boom").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);

    let events = drain_events(&mut rx);
    assert!(matches!(events.last(), Some(StatusEvent::Failed { .. })));
}

#[tokio::test]
async fn tampered_checkpoint_is_rejected_and_the_run_starts_fresh() {
    let h = harness(50).await;
    let reference = sample_backtest("bt-ref");
    h.submit(&reference).await;
    h.worker.drain().await.unwrap();
    let reference_trades = h.store.list_trades("bt-ref").await.unwrap();

    // A blob whose portfolio was mutated after sealing.
    let engine = CheckpointEngine::new(Duration::days(7));
    let timestamp = candle_groups(50)[9][0].timestamp;
    let mut blob = engine
        .build(CheckpointState {
            last_processed_index: 9,
            last_processed_timestamp: timestamp,
            portfolio: Portfolio::with_cash(9_999.0),
            peak_value: 10_000.0,
            max_drawdown: 0.0,
            rng_state: 99,
            persisted_counts: ResultCounts::default(),
            checksum: String::new(),
        })
        .unwrap();
    blob.portfolio.cash_balance = 1.0;

    let mut tampered = sample_backtest("bt-tampered");
    tampered.seed = reference.seed.clone();
    tampered.checkpoint = Some(blob);
    tampered.last_checkpoint_at = Some(Utc::now());
    tampered.processed_count = 10;
    tampered.total_count = 50;
    h.submit(&tampered).await;

    h.worker.drain().await.unwrap();
    let record = h.store.get("bt-tampered").await.unwrap().unwrap();
    assert_eq!(record.status, BacktestStatus::Completed);
    assert_eq!(record.processed_count, 50);
    // The rejected checkpoint did not poison the run: output matches a
    // clean run with the same seed.
    assert_eq!(
        h.store.list_trades("bt-tampered").await.unwrap(),
        reference_trades
    );
}
