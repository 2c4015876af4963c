//! Core status and mode types for the backtest execution core.
//!
//! This module defines the fundamental enums used throughout the system: the
//! backtest lifecycle state machine, the replay mode, and the queue job
//! states. These are the core domain concepts that define what an execution
//! *is allowed to do* at any moment.
//!
//! # The status state machine
//!
//! ```text
//! PENDING ──lease──▶ RUNNING ──finish──▶ COMPLETED
//!                       │  ──pause───▶ PAUSED ──resume──▶ PENDING
//!                       │  ──error───▶ FAILED
//!                       └──cancel───▶ CANCELED
//! ```
//!
//! `COMPLETED`, `FAILED`, and `CANCELED` are terminal. The recovery sweep at
//! boot may additionally move any non-terminal status back to `PENDING` (or to
//! `FAILED` when a backtest is unrecoverable), and a `COMPLETED` backtest with
//! unprocessed timestamps may be resumed to `PENDING`. Transitions are
//! enforced through [`BacktestStatus::can_transition_to`].
//!
//! # Examples
//!
//! ```rust
//! use backtest_core::types::BacktestStatus;
//!
//! assert!(BacktestStatus::Pending.can_transition_to(BacktestStatus::Running));
//! assert!(!BacktestStatus::Failed.can_transition_to(BacktestStatus::Pending));
//! assert!(BacktestStatus::Completed.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a backtest record.
///
/// Stored as uppercase `TEXT` in the database; see [`BacktestStatus::encode`]
/// and [`BacktestStatus::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BacktestStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl BacktestStatus {
    /// Whether this status admits no further transitions by a worker.
    ///
    /// A `Completed` backtest is terminal for the worker, but may still be
    /// resumed through the recovery service when timestamps remain
    /// unprocessed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Validates a status transition against the state machine.
    ///
    /// `Pending -> Pending` is permitted so the recovery sweep can rewrite a
    /// pending record (incrementing its auto-resume count) without a special
    /// case.
    #[must_use]
    pub fn can_transition_to(self, next: BacktestStatus) -> bool {
        use BacktestStatus::*;
        match self {
            Pending => matches!(next, Running | Pending | Failed),
            Running => matches!(next, Paused | Completed | Failed | Canceled | Pending),
            Paused => matches!(next, Running | Pending | Failed),
            // Resume of a completed backtest with unprocessed timestamps.
            Completed => matches!(next, Pending),
            Failed | Canceled => false,
        }
    }

    /// Stable string form used in database columns and log fields.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Inverse of [`encode`](Self::encode). Returns `None` for unknown input.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Replay mode of a backtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BacktestMode {
    /// Historical candles replayed as fast as the worker can process them.
    Historical,
    /// Recorded live data replayed with original pacing semantics.
    LiveReplay,
}

impl BacktestMode {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Historical => "HISTORICAL",
            Self::LiveReplay => "LIVE_REPLAY",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "HISTORICAL" => Some(Self::Historical),
            "LIVE_REPLAY" => Some(Self::LiveReplay),
            _ => None,
        }
    }
}

impl fmt::Display for BacktestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// State of a job record in the execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Whether the job no longer occupies its key (a new job with the same id
    /// may be enqueued).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the job is still queued and will eventually be offered to a
    /// worker without intervention.
    #[must_use]
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        for status in [BacktestStatus::Failed, BacktestStatus::Canceled] {
            for next in [
                BacktestStatus::Pending,
                BacktestStatus::Running,
                BacktestStatus::Paused,
                BacktestStatus::Completed,
                BacktestStatus::Failed,
                BacktestStatus::Canceled,
            ] {
                assert!(!status.can_transition_to(next), "{status} -> {next}");
            }
        }
    }

    #[test]
    fn only_running_reaches_paused_completed_canceled() {
        for status in [
            BacktestStatus::Pending,
            BacktestStatus::Paused,
            BacktestStatus::Completed,
        ] {
            assert!(!status.can_transition_to(BacktestStatus::Paused));
            assert!(!status.can_transition_to(BacktestStatus::Canceled));
        }
        assert!(BacktestStatus::Running.can_transition_to(BacktestStatus::Paused));
        assert!(BacktestStatus::Running.can_transition_to(BacktestStatus::Completed));
        assert!(BacktestStatus::Running.can_transition_to(BacktestStatus::Canceled));
    }

    #[test]
    fn status_encoding_round_trips() {
        for status in [
            BacktestStatus::Pending,
            BacktestStatus::Running,
            BacktestStatus::Paused,
            BacktestStatus::Completed,
            BacktestStatus::Failed,
            BacktestStatus::Canceled,
        ] {
            assert_eq!(BacktestStatus::decode(status.encode()), Some(status));
        }
        assert_eq!(BacktestStatus::decode("bogus"), None);
    }

    #[test]
    fn job_state_queued_classification() {
        assert!(JobState::Waiting.is_queued());
        assert!(JobState::Delayed.is_queued());
        assert!(!JobState::Active.is_queued());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }
}
