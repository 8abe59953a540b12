//! Segmented download engine with pause, resume and stop.
//!
//! A [`DownloadEngine`] owns one download. [`DownloadEngine::start`] spawns a
//! driver task on the current Tokio runtime and hands back an
//! [`EventReceiver`]; the engine handle controls the running download.
//!
//! # Example
//!
//! ```no_run
//! use rangefetch_core::config::EngineConfig;
//! use rangefetch_core::download::{DownloadEngine, DownloadRequest, EngineEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = DownloadRequest::new("https://example.com/big.iso", "./downloads");
//! let (engine, mut events) = DownloadEngine::start(request, EngineConfig::default())?;
//! while let Some(event) = events.recv().await {
//!     if let EngineEvent::Progress { total_progress, .. } = &event {
//!         println!("{total_progress} bytes");
//!     }
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! println!("finished as {}", engine.wait().await);
//! # Ok(())
//! # }
//! ```

mod error_mapping;
mod persistence;
mod state;
mod task;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use state::{EngineSnapshot, EngineState};

use self::persistence::persist_resume_record;
use self::task::{TaskShared, lock};
use super::constants::STOP_GRACE;
use super::events::{EventReceiver, EventSink};
use super::resolver::CdnHint;
use super::worker::{HaltReason, HaltSignal};
use crate::config::{ConfigError, EngineConfig};

/// Error type for engine control operations.
///
/// Download failures are not returned here; they arrive as
/// [`EngineEvent::Error`](super::EngineEvent::Error).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration did not validate.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} a download that is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    /// `start` was called outside a Tokio runtime.
    #[error("no Tokio runtime is running; start the engine from within one")]
    NoRuntime,
}

/// What to download and where.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// Sent with every request. Names match case-insensitively.
    pub headers: HashMap<String, String>,
    /// Directory the file is written to; created if missing.
    pub save_dir: PathBuf,
    /// Preferred file name. Together with `declared_size`, skips link resolution.
    pub file_name: Option<String>,
    /// Size known ahead of time. Zero counts as unknown.
    pub declared_size: Option<u64>,
    pub cdn_hint: Option<CdnHint>,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(url: impl Into<String>, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            save_dir: save_dir.into(),
            file_name: None,
            declared_size: None,
            cdn_hint: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    #[must_use]
    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_cdn_hint(mut self, hint: CdnHint) -> Self {
        self.cdn_hint = Some(hint);
        self
    }
}

/// Handle to one running download.
///
/// Dropping the handle requests a stop; the driver still saves resume data.
#[derive(Debug)]
pub struct DownloadEngine {
    shared: Arc<TaskShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadEngine {
    /// Validates `config` and starts downloading in the background.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for a bad configuration and
    /// [`EngineError::NoRuntime`] outside a Tokio runtime.
    pub fn start(
        request: DownloadRequest,
        config: EngineConfig,
    ) -> Result<(Self, EventReceiver), EngineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let (events, receiver) = EventSink::channel();
        info!(url = %request.url, dir = %request.save_dir.display(), "starting download");
        let shared = Arc::new(TaskShared::new(request, config, events));
        let driver = runtime.spawn(task::drive(Arc::clone(&shared)));
        Ok((
            Self {
                shared,
                driver: Mutex::new(Some(driver)),
            },
            receiver,
        ))
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let blocks = self.shared.block_snapshots();
        let task = lock(&self.shared.task);
        EngineSnapshot {
            url: task.url.clone(),
            file_name: task.file_name.clone(),
            path: task.path.clone(),
            file_size: task.file_size,
            multi_thread_supported: task.multi,
            state: self.shared.state(),
            total_progress: blocks.iter().map(|b| b.progress).sum(),
            blocks,
        }
    }

    /// Halts every block and saves resume data. Pausing twice is a no-op, and
    /// so is pausing once every byte is in and the download is being finalized.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidState`] once the download ended or is stopping.
    pub async fn pause(&self) -> Result<(), EngineError> {
        {
            let mut control = lock(&self.shared.control);
            let state = control.visible_state();
            if state.is_terminal() || control.stopping {
                return Err(EngineError::InvalidState {
                    operation: "pause",
                    state,
                });
            }
            if control.paused {
                return Ok(());
            }
            if control.finalizing {
                debug!("download is finishing, pause ignored");
                return Ok(());
            }
            control.paused = true;
            control.halt.halt(HaltReason::Paused);
            self.shared.publish(&control);
        }
        info!("download paused");

        let shared = Arc::clone(&self.shared);
        if let Err(error) = tokio::task::spawn_blocking(move || persist_resume_record(&shared)).await
        {
            warn!(%error, "saving resume data on pause failed");
        }
        Ok(())
    }

    /// Continues a paused download from the saved block positions.
    /// Resuming a running download is a no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidState`] once the download ended or is stopping.
    pub fn resume(&self) -> Result<(), EngineError> {
        {
            let mut control = lock(&self.shared.control);
            let state = control.visible_state();
            if state.is_terminal() || control.stopping {
                return Err(EngineError::InvalidState {
                    operation: "resume",
                    state,
                });
            }
            if !control.paused {
                return Ok(());
            }
            control.paused = false;
            control.halt = HaltSignal::new();
            self.shared.publish(&control);
        }
        info!("download resumed");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stops the download for good, keeping resume data. Never fails;
    /// stopping an ended download does nothing.
    pub async fn stop(&self) {
        if self.request_stop() {
            info!("stopping download");
        }

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(STOP_GRACE * 2, &mut driver)
                .await
                .is_err()
            {
                warn!("download driver did not stop in time, aborting it");
                driver.abort();
                let shared = Arc::clone(&self.shared);
                if let Err(error) =
                    tokio::task::spawn_blocking(move || persist_resume_record(&shared)).await
                {
                    warn!(%error, "saving resume data after abort failed");
                }
                self.shared.set_phase(EngineState::Stopped);
            }
        }
        self.wait().await;
    }

    /// Waits for a terminal state and returns it.
    pub async fn wait(&self) -> EngineState {
        let mut states = self.shared.state_tx.subscribe();
        match states.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.shared.state(),
        }
    }

    /// Marks the engine as stopping. Returns `false` if it already was or has ended.
    fn request_stop(&self) -> bool {
        {
            let mut control = lock(&self.shared.control);
            if control.visible_state().is_terminal() || control.stopping {
                return false;
            }
            control.stopping = true;
            control.halt.halt(HaltReason::Stopped);
        }
        self.shared.shutdown.cancel();
        self.shared.wake.notify_one();
        true
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        self.request_stop();
    }
}
