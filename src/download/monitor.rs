//! Progress aggregation, smoothed speed and completion detection.
//!
//! [`ProgressMonitor`] is pure bookkeeping: the engine feeds it block
//! snapshots on every tick and acts on the returned [`MonitorVerdict`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::block::{BlockSnapshot, BlockStatus};
use crate::config::EngineConfig;

/// Files below this size use the looser near-completion ratio.
const SMALL_FILE_BYTES: u64 = 10 * 1024;

/// Most bytes that may be missing for [`near_completion`] to hold. The ratio
/// must hold as well; neither limit alone finishes a download.
const NEAR_COMPLETION_MAX_MISSING: u64 = 5;

/// Whether a stalled download that is `progress` bytes into `file_size`
/// should be treated as finished.
///
/// Holds when at most 5 bytes are missing and at least 99.5% of the file
/// (99% below 10 KiB) is written. Covers servers whose chunked framing loses
/// the last few bytes of a range.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn near_completion(progress: u64, file_size: u64) -> bool {
    if file_size == 0 {
        return false;
    }
    if progress >= file_size {
        return true;
    }
    let missing = file_size - progress;
    let ratio = progress as f64 / file_size as f64;
    let required = if file_size < SMALL_FILE_BYTES {
        0.99
    } else {
        0.995
    };
    missing <= NEAR_COMPLETION_MAX_MISSING && ratio >= required
}

/// Rolling average over the last few speed samples.
#[derive(Debug, Clone)]
pub struct SpeedWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl SpeedWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a sample and returns the new average.
    pub fn push(&mut self, bytes_per_second: u64) -> u64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes_per_second);
        self.average()
    }

    #[must_use]
    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u128 = self.samples.iter().map(|&s| u128::from(s)).sum();
        u64::try_from(sum / self.samples.len() as u128).unwrap_or(u64::MAX)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// What the engine should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// Keep downloading.
    Running,
    /// Every byte is written (known size) or the stream ended (unknown size).
    Complete,
    /// Known size, stalled a few bytes short: finish at the declared size.
    NearComplete,
    /// Unknown size, no progress for the grace period: the data on disk is the file.
    Stalled,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub total_progress: u64,
    pub bytes_per_second: u64,
    pub verdict: MonitorVerdict,
}

/// Tick-to-tick state of the progress monitor.
#[derive(Debug)]
pub struct ProgressMonitor {
    speed: SpeedWindow,
    stall_grace: Duration,
    near_completion_enabled: bool,
    last_received: u64,
    last_tick: Instant,
    last_progress: u64,
    last_change: Instant,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new(config: &EngineConfig, now: Instant) -> Self {
        Self {
            speed: SpeedWindow::new(config.speed_window),
            stall_grace: config.stall_grace,
            near_completion_enabled: config.near_completion,
            last_received: 0,
            last_tick: now,
            last_progress: 0,
            last_change: now,
        }
    }

    /// Restarts stall tracking, e.g. after a resume, so paused time does not count.
    pub fn reset(&mut self, now: Instant, received: u64) {
        self.speed.clear();
        self.last_received = received;
        self.last_tick = now;
        self.last_change = now;
    }

    /// Folds one tick into the running state.
    ///
    /// `received` is the engine's running count of bytes taken off the wire,
    /// used only for speed.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn observe(
        &mut self,
        now: Instant,
        blocks: &[BlockSnapshot],
        received: u64,
        file_size: Option<u64>,
    ) -> Observation {
        let total_progress: u64 = blocks.iter().map(|b| b.progress).sum();

        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        if elapsed > 0.0 {
            let delta = received.saturating_sub(self.last_received);
            self.speed.push((delta as f64 / elapsed) as u64);
        }
        self.last_received = received;
        self.last_tick = now;

        let stalled = total_progress == self.last_progress;
        if !stalled {
            self.last_progress = total_progress;
            self.last_change = now;
        }
        let stalled_for = now.saturating_duration_since(self.last_change);

        let verdict = match file_size {
            Some(size) => {
                if total_progress >= size {
                    MonitorVerdict::Complete
                } else if self.near_completion_enabled
                    && stalled
                    && near_completion(total_progress, size)
                {
                    MonitorVerdict::NearComplete
                } else {
                    MonitorVerdict::Running
                }
            }
            None => {
                let any_connecting = blocks.iter().any(|b| b.status == BlockStatus::Connecting);
                if !blocks.is_empty() && blocks.iter().all(|b| b.status == BlockStatus::Completed)
                {
                    MonitorVerdict::Complete
                } else if total_progress > 0
                    && stalled
                    && !any_connecting
                    && stalled_for >= self.stall_grace
                {
                    MonitorVerdict::Stalled
                } else {
                    MonitorVerdict::Running
                }
            }
        };

        Observation {
            total_progress,
            bytes_per_second: self.speed.average(),
            verdict,
        }
    }
}
