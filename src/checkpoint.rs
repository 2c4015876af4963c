//! Checkpoint blobs and the engine that builds, verifies, and restores them.
//!
//! A checkpoint captures everything a worker needs to resume a simulation
//! deterministically: the portfolio, the RNG state word, drawdown accounting,
//! how far the candle sequence has been processed, and how many result rows
//! are already durable. Integrity is a SHA-256 checksum (first 16 hex chars)
//! over the canonical serialization of every other field; canonical here
//! means `serde_json`'s sorted object keys.
//!
//! Verification on load is strict: a checksum disagreement, an index outside
//! the dataset, or a timestamp that no longer matches the dataset all reject
//! the blob. A rejected or stale checkpoint is cleared and the run starts
//! fresh; it never fails the backtest.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::model::{Portfolio, ResultCounts};
use crate::rng::DeterministicRng;

/// Hex characters of the SHA-256 digest kept as the checksum.
const CHECKSUM_LEN: usize = 16;

/// The embedded checkpoint blob, serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// Position in the timestamp sequence up to and including which the
    /// algorithm has executed.
    pub last_processed_index: u64,
    /// Timestamp at that index, verified against market data on restore.
    pub last_processed_timestamp: DateTime<Utc>,
    pub portfolio: Portfolio,
    pub peak_value: f64,
    pub max_drawdown: f64,
    /// Opaque state word of the deterministic generator.
    pub rng_state: u64,
    /// Result rows already durably persisted at checkpoint time.
    pub persisted_counts: ResultCounts,
    /// First 16 hex chars of SHA-256 over the canonical serialization of the
    /// other fields. Empty in a draft; [`CheckpointEngine::build`] fills it.
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint serialization failed: {source}")]
    #[diagnostic(
        code(backtest::checkpoint::serde),
        help("Checkpoint fields must serialize to finite JSON values.")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

/// Why a stored checkpoint was rejected on load.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum CheckpointRejection {
    /// Storage corruption or unsanctioned mutation.
    #[error("checksum mismatch: stored {stored}, recomputed {recomputed}")]
    #[diagnostic(code(backtest::checkpoint::checksum))]
    ChecksumMismatch { stored: String, recomputed: String },

    #[error("last processed index {index} out of bounds for {len} timestamps")]
    #[diagnostic(code(backtest::checkpoint::out_of_bounds))]
    IndexOutOfBounds { index: u64, len: usize },

    /// The dataset changed underneath the checkpoint.
    #[error("timestamp mismatch at index {index}: checkpoint {stored}, dataset {dataset}")]
    #[diagnostic(code(backtest::checkpoint::timestamp))]
    TimestampMismatch {
        index: u64,
        stored: DateTime<Utc>,
        dataset: DateTime<Utc>,
    },
}

/// Simulation state reconstructed from a verified checkpoint.
#[derive(Debug, Clone)]
pub struct RestoredSimulation {
    pub portfolio: Portfolio,
    pub rng: DeterministicRng,
    pub counts: ResultCounts,
    pub peak_value: f64,
    pub max_drawdown: f64,
    /// First candle index to process after the restore.
    pub resume_index: u64,
}

/// Builds and verifies checkpoint blobs and decides staleness.
#[derive(Debug, Clone)]
pub struct CheckpointEngine {
    max_age: chrono::Duration,
}

impl CheckpointEngine {
    #[must_use]
    pub fn new(max_age: chrono::Duration) -> Self {
        Self { max_age }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_checkpoint_age)
    }

    /// Seal a draft blob: compute the checksum over the canonical
    /// serialization of the other fields and embed it.
    pub fn build(&self, mut draft: CheckpointState) -> Result<CheckpointState, CheckpointError> {
        draft.checksum = Self::compute_checksum(&draft)?;
        Ok(draft)
    }

    /// Verify a stored blob against the dataset it will resume over.
    ///
    /// Checks, in order: checksum, index bounds, timestamp agreement.
    pub fn validate(
        &self,
        blob: &CheckpointState,
        dataset_timestamps: &[DateTime<Utc>],
    ) -> Result<(), CheckpointRejection> {
        let recomputed = Self::compute_checksum(blob).map_err(|_| {
            // A blob that cannot be reserialized cannot match its checksum.
            CheckpointRejection::ChecksumMismatch {
                stored: blob.checksum.clone(),
                recomputed: String::new(),
            }
        })?;
        if recomputed != blob.checksum {
            return Err(CheckpointRejection::ChecksumMismatch {
                stored: blob.checksum.clone(),
                recomputed,
            });
        }

        let index = blob.last_processed_index;
        let len = dataset_timestamps.len();
        if index as usize >= len {
            return Err(CheckpointRejection::IndexOutOfBounds { index, len });
        }

        let dataset = dataset_timestamps[index as usize];
        if dataset != blob.last_processed_timestamp {
            return Err(CheckpointRejection::TimestampMismatch {
                index,
                stored: blob.last_processed_timestamp,
                dataset,
            });
        }

        Ok(())
    }

    /// Whether a checkpoint written at `last_checkpoint_at` is too old to
    /// resume. A stale resume would replay against a possibly-changed world.
    #[must_use]
    pub fn is_stale(&self, last_checkpoint_at: DateTime<Utc>) -> bool {
        Utc::now() - last_checkpoint_at > self.max_age
    }

    /// Reconstruct simulation state. No validation beyond what
    /// [`validate`](Self::validate) already performed.
    #[must_use]
    pub fn restore(&self, blob: &CheckpointState) -> RestoredSimulation {
        RestoredSimulation {
            portfolio: blob.portfolio.clone(),
            rng: DeterministicRng::from_state(blob.rng_state),
            counts: blob.persisted_counts,
            peak_value: blob.peak_value,
            max_drawdown: blob.max_drawdown,
            resume_index: blob.last_processed_index + 1,
        }
    }

    fn compute_checksum(blob: &CheckpointState) -> Result<String, CheckpointError> {
        let canonical = Self::canonical_json(blob)?;
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hexed = hex::encode(digest);
        hexed.truncate(CHECKSUM_LEN);
        Ok(hexed)
    }

    /// Canonical serialization: JSON with sorted object keys, checksum field
    /// removed.
    fn canonical_json(blob: &CheckpointState) -> Result<String, CheckpointError> {
        let mut value =
            serde_json::to_value(blob).map_err(|source| CheckpointError::Serde { source })?;
        if let Some(object) = value.as_object_mut() {
            object.remove("checksum");
        }
        serde_json::to_string(&value).map_err(|source| CheckpointError::Serde { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft() -> CheckpointState {
        CheckpointState {
            last_processed_index: 99,
            last_processed_timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            portfolio: Portfolio::with_cash(500.0),
            peak_value: 510.0,
            max_drawdown: 0.02,
            rng_state: 0xDEAD_BEEF,
            persisted_counts: ResultCounts {
                trades: 12,
                signals: 99,
                fills: 12,
                snapshots: 1,
            },
            checksum: String::new(),
        }
    }

    #[test]
    fn build_embeds_a_sixteen_char_checksum() {
        let engine = CheckpointEngine::new(chrono::Duration::days(7));
        let blob = engine.build(draft()).unwrap();
        assert_eq!(blob.checksum.len(), 16);
        assert!(blob.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_is_deterministic() {
        let engine = CheckpointEngine::new(chrono::Duration::days(7));
        let a = engine.build(draft()).unwrap();
        let b = engine.build(a.clone()).unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn mutation_breaks_the_checksum() {
        let engine = CheckpointEngine::new(chrono::Duration::days(7));
        let timestamps = vec![draft().last_processed_timestamp; 100];
        let mut blob = engine.build(draft()).unwrap();
        blob.portfolio.cash_balance += 1.0;
        assert!(matches!(
            engine.validate(&blob, &timestamps),
            Err(CheckpointRejection::ChecksumMismatch { .. })
        ));
    }
}
