//! # backtest-core: Durable, Resumable Backtest Execution
//!
//! backtest-core replays historical market data through a user-supplied
//! trading algorithm, producing deterministic trade/fill/signal streams while
//! surviving process restarts. It combines a keyed durable job queue with
//! worker leases, periodic checkpointing with integrity verification,
//! boot-time crash recovery with stale-lock breaking, a cooperative
//! pause/resume protocol over a shared KV store, and per-backtest status
//! streaming.
//!
//! ## Core Concepts
//!
//! - **Backtest**: a durable record driving one simulated replay
//! - **Job**: a queue entry keyed by backtest id — at most one non-terminal
//!   job per backtest
//! - **Checkpoint**: a checksummed snapshot of simulation state sufficient to
//!   resume deterministically
//! - **Lease**: exclusive short-term ownership of a job by a worker, backed
//!   by a TTL lock in the shared KV store
//! - **Recovery**: the boot-time sweep that reconciles queue state against
//!   durable state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use backtest_core::accounting::AverageCostAccounting;
//! use backtest_core::algorithm::StaticResolver;
//! use backtest_core::config::EngineConfig;
//! use backtest_core::indicators::IndicatorCache;
//! use backtest_core::kv::InMemoryKv;
//! use backtest_core::market::InMemoryDataSource;
//! use backtest_core::queue::ExecutionQueue;
//! use backtest_core::recovery::RecoveryService;
//! use backtest_core::status::StatusStream;
//! use backtest_core::store::BacktestStore;
//! use backtest_core::worker::Worker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let store = Arc::new(BacktestStore::connect(&config.database_url).await?);
//! let kv = Arc::new(InMemoryKv::new());
//! let queue = Arc::new(ExecutionQueue::new(
//!     store.pool().clone(),
//!     kv.clone(),
//!     &config,
//! ));
//! let status = Arc::new(StatusStream::new(config.status_buffer_capacity));
//!
//! // Recovery runs once at boot, before workers accept leases.
//! let recovery = RecoveryService::new(
//!     store.clone(),
//!     queue.clone(),
//!     kv.clone(),
//!     status.clone(),
//!     config.clone(),
//! );
//! recovery.recover_orphaned().await?;
//!
//! let worker = Worker::new(
//!     store,
//!     queue,
//!     kv,
//!     status,
//!     Arc::new(InMemoryDataSource::new()),
//!     Arc::new(StaticResolver::new()),
//!     Arc::new(AverageCostAccounting),
//!     Arc::new(IndicatorCache::disabled()),
//!     config,
//! );
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! Given identical inputs (algorithm, dataset, seed, config), two runs
//! produce identical result sequences — including across a mid-run crash and
//! recovery. This rests on three rules: algorithms take all randomness from
//! the injected [`rng::DeterministicRng`], candle ordering is stable, and the
//! checkpoint verifies dataset timestamps on restore.
//!
//! ## Module Guide
//!
//! - [`queue`] - Durable keyed FIFO with worker leases and stale-lock breaking
//! - [`worker`] - The execution loop: restore/init, step, checkpoint, pause
//! - [`checkpoint`] - Blob build/verify/restore and staleness
//! - [`recovery`] - Boot-time reconciliation plus pause/resume entry points
//! - [`pause`] - Cooperative pause/cancel flags in the shared KV store
//! - [`status`] - Topic-per-backtest status streaming
//! - [`store`] - SQLite persistence for records and result sequences
//! - [`market`], [`algorithm`], [`accounting`], [`indicators`] - external
//!   collaborator seams

pub mod accounting;
pub mod algorithm;
pub mod checkpoint;
pub mod config;
pub mod indicators;
pub mod kv;
pub mod market;
pub mod model;
pub mod pause;
pub mod queue;
pub mod recovery;
pub mod rng;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod worker;
