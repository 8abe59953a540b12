//! Events a running engine reports to its caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use super::block::BlockSnapshot;

/// A state change of a download, delivered in order on the engine's channel.
///
/// Serializes with an `event` tag, e.g. `{"event":"speed","bytes_per_second":1024}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Planning finished. Sent once per engine.
    Initialized {
        /// Whether the download runs as several ranged blocks.
        multi_thread_supported: bool,
    },
    /// Per-block progress, sent on every monitor tick.
    Progress {
        blocks: Vec<BlockSnapshot>,
        /// Bytes written across all blocks.
        total_progress: u64,
        /// Total size, `None` while unknown.
        file_size: Option<u64>,
    },
    /// Smoothed transfer speed.
    Speed { bytes_per_second: u64 },
    /// The file on disk was renamed.
    FileNameChanged { new_name: String },
    /// Terminal: the file is complete.
    Completed,
    /// Terminal: the download failed.
    Error { message: String },
}

impl EngineEvent {
    /// True for `Completed` and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }
}

/// Receiving half handed to the caller by [`DownloadEngine::start`](super::DownloadEngine::start).
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Sending half shared by the engine's tasks.
///
/// After the first terminal event every later event is dropped, so a
/// download reports at most one `Completed` or `Error`.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Sends `event`. Returns false if it was suppressed.
    pub(crate) fn emit(&self, event: EngineEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::AcqRel) {
                return false;
            }
        } else if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
        true
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_terminal_event_is_delivered() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.emit(EngineEvent::Speed {
            bytes_per_second: 1
        }));
        assert!(sink.emit(EngineEvent::Completed));
        assert!(!sink.emit(EngineEvent::Error {
            message: "late".into()
        }));
        assert!(!sink.emit(EngineEvent::Speed {
            bytes_per_second: 2
        }));
        assert!(sink.is_terminated());

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::Speed {
                bytes_per_second: 1
            }
        );
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.emit(EngineEvent::Completed));
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_string(&EngineEvent::Initialized {
            multi_thread_supported: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"initialized","multi_thread_supported":true}"#);

        let json = serde_json::to_string(&EngineEvent::Completed).unwrap();
        assert_eq!(json, r#"{"event":"completed"}"#);
    }
}
