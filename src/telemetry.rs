//! Rendering of status updates for console sinks, plus tracing setup.

use crate::status::{StatusEvent, StatusUpdate};

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[36m"; // cyan
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for one status update.
#[derive(Clone, Debug, Default)]
pub struct UpdateRender {
    pub context: Option<String>,
    pub line: String,
}

pub trait StatusFormatter: Send + Sync {
    fn render(&self, update: &StatusUpdate) -> UpdateRender;
}

pub struct PlainFormatter;

impl StatusFormatter for PlainFormatter {
    fn render(&self, update: &StatusUpdate) -> UpdateRender {
        let body = match &update.event {
            StatusEvent::Queued {
                resumed,
                has_checkpoint,
                checkpoint_index,
            } => match checkpoint_index {
                Some(index) => format!(
                    "queued (resumed={resumed}, checkpoint at index {index})"
                ),
                None => format!("queued (resumed={resumed}, checkpoint={has_checkpoint})"),
            },
            StatusEvent::Running => "running".to_string(),
            StatusEvent::Progress { fraction, index } => {
                format!("progress {:.1}% (index {index})", fraction * 100.0)
            }
            StatusEvent::Paused => "paused".to_string(),
            StatusEvent::Resumed => "resumed".to_string(),
            StatusEvent::Completed => "completed".to_string(),
            StatusEvent::Failed { message } => format!("failed: {message}"),
        };
        UpdateRender {
            context: Some(update.backtest_id.clone()),
            line: format!(
                "{CONTEXT_COLOR}[{}]{RESET_COLOR} {LINE_COLOR}{body}{RESET_COLOR}",
                update.backtest_id
            ),
        }
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`. Call once at process start;
/// subsequent calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
