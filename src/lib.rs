//! Rangefetch core library
//!
//! A segmented, resumable HTTP download engine: files are fetched as
//! parallel byte ranges into a preallocated target, with resume data kept
//! beside the file and progress delivered as events.
//!
//! # Architecture
//!
//! - [`config`] - Engine and network settings with validation
//! - [`download`] - Planning, block workers, the progress monitor and the engine

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, DEFAULT_CONCURRENCY, EngineConfig, NetworkConfig};
pub use download::{
    BlockSnapshot, BlockStatus, CdnHint, DownloadEngine, DownloadError, DownloadRequest,
    EngineError, EngineEvent, EngineSnapshot, EngineState, EventReceiver,
};
