use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::download::block::BlockSnapshot;
use crate::download::worker::HaltSignal;

/// Lifecycle of a [`DownloadEngine`](super::DownloadEngine).
///
/// `Created → Initializing → Planning → Downloading ⇄ Paused`, ending in one
/// of the terminal states `Completed`, `Failed` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    /// Building the session and resolving the link.
    Initializing,
    /// Choosing the target file and laying out blocks.
    Planning,
    Downloading,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a download, for callers that poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    /// URL blocks are fetched from (after redirects, once resolved).
    pub url: String,
    pub file_name: Option<String>,
    pub path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub multi_thread_supported: bool,
    pub state: EngineState,
    pub total_progress: u64,
    pub blocks: Vec<BlockSnapshot>,
}

/// Control flags shared by the public handle and the driver task.
///
/// The visible state is `Paused` whenever a pause is pending on a
/// non-terminal phase; otherwise it is the driver's phase.
#[derive(Debug)]
pub(super) struct Control {
    pub(super) phase: EngineState,
    pub(super) paused: bool,
    pub(super) stopping: bool,
    /// Every byte is in; the sidecar is about to be removed.
    pub(super) finalizing: bool,
    /// Halt signal of the current run generation.
    pub(super) halt: HaltSignal,
}

impl Control {
    pub(super) fn new() -> Self {
        Self {
            phase: EngineState::Created,
            paused: false,
            stopping: false,
            finalizing: false,
            halt: HaltSignal::new(),
        }
    }

    pub(super) fn visible_state(&self) -> EngineState {
        if self.paused && !self.phase.is_terminal() {
            EngineState::Paused
        } else {
            self.phase
        }
    }
}
