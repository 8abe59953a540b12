//! Segmented, resumable HTTP downloads.
//!
//! A download is split into byte-range blocks fetched in parallel and
//! written in place into one preallocated file. Block positions are saved
//! to a `.resume` sidecar so an interrupted download continues where it
//! stopped. Servers that ignore ranges, or that do not declare a size,
//! fall back to a single stream.
//!
//! # Features
//!
//! - Size-aware block planning with dynamic splitting of slow blocks
//! - Per-block retry with exponential backoff, honoring `Retry-After`
//! - Pause, resume and stop, with resume data kept on disk
//! - Redirect, `Content-Disposition` and content-type aware file naming
//! - Progress and speed reported on an event channel
//!
//! # Example
//!
//! ```no_run
//! use rangefetch_core::config::EngineConfig;
//! use rangefetch_core::download::{DownloadEngine, DownloadRequest, EngineState};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = DownloadRequest::new("https://example.com/video.mp4", "./downloads");
//! let (engine, _events) = DownloadEngine::start(request, EngineConfig::default())?;
//! assert_eq!(engine.wait().await, EngineState::Completed);
//! # Ok(())
//! # }
//! ```

mod block;
mod client;
pub mod constants;
mod engine;
mod error;
mod events;
mod filename;
mod monitor;
mod planner;
mod resolver;
mod resume;
mod retry;
mod worker;

pub use block::{BlockSnapshot, BlockStatus, DownloadBlock};
pub use client::{ConnectionManager, Session};
pub use engine::{DownloadEngine, DownloadRequest, EngineError, EngineSnapshot, EngineState};
pub use error::DownloadError;
pub use events::{EngineEvent, EventReceiver};
pub use monitor::{MonitorVerdict, Observation, ProgressMonitor, SpeedWindow, near_completion};
pub use planner::{ByteRange, effective_concurrency, plan};
pub use resolver::{CdnHint, LinkResolver, ResolvedLink, session_for};
pub use resume::{
    BlockPositions, RESUME_FORMAT_VERSION, RESUME_SUFFIX, ResumeFormatError, ResumeRecord,
    ResumeStore,
};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
pub use worker::BlockError;

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
