//! One byte range of the target resource and its lock-free progress state.
//!
//! A [`DownloadBlock`] is shared between its worker (the only writer of
//! `current`, `status`, `retries` and `speed`) and the progress monitor, which
//! only reads. `end` has one extra writer: the engine may shrink it when it
//! splits a large remaining range off to an idle worker.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use super::constants::UNKNOWN_SIZE_END;
use super::planner::ByteRange;

/// Lifecycle state of a block.
///
/// `Completed` is sticky: once reached, no other state is ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BlockStatus {
    /// Planned or restored, not yet picked up by a worker.
    Idle = 0,
    /// Request sent (or waiting out a retry backoff), no body data yet.
    Connecting = 1,
    /// Body bytes are streaming to disk.
    Downloading = 2,
    /// Halted by a pause; resumes from `current`.
    Paused = 3,
    /// Every byte of the range is on disk.
    Completed = 4,
    /// Gave up after retries or on a fatal error.
    Failed = 5,
    /// Halted by a stop or a mode change.
    Stopped = 6,
}

impl BlockStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Downloading,
            3 => Self::Paused,
            4 => Self::Completed,
            5 => Self::Failed,
            6 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    /// True while a worker owns the block and is talking to the server.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Downloading)
    }
}

/// Point-in-time copy of a block, as carried by progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockSnapshot {
    /// First byte offset.
    pub start: u64,
    /// Next byte to write.
    pub current: u64,
    /// Last byte offset (inclusive). `u64::MAX - 1` while the size is unknown.
    pub end: u64,
    /// Bytes written so far (`current - start`, bounded by the range).
    pub progress: u64,
    /// Block state.
    pub status: BlockStatus,
    /// Failed attempts since the last attempt that made progress.
    pub retries: u32,
    /// Smoothed speed in bytes per second.
    pub speed: u64,
}

/// A contiguous byte range `[start, end]` and its download position.
///
/// Invariant: `start <= current <= end + 1`; the block is complete iff
/// `current == end + 1`.
#[derive(Debug)]
pub struct DownloadBlock {
    start: u64,
    current: AtomicU64,
    end: AtomicU64,
    status: AtomicU8,
    retries: AtomicU32,
    speed: AtomicU64,
}

impl DownloadBlock {
    /// A fresh block for `range`.
    #[must_use]
    pub fn new(range: ByteRange) -> Self {
        Self::restored(range.start, range.start, range.end)
    }

    /// The single block of a download whose size is not known.
    #[must_use]
    pub fn unknown_size() -> Self {
        Self::restored(0, 0, UNKNOWN_SIZE_END)
    }

    /// A block rebuilt from persisted positions. `current` is clamped into the range.
    #[must_use]
    pub fn restored(start: u64, current: u64, end: u64) -> Self {
        let end = end.max(start).min(UNKNOWN_SIZE_END);
        let current = current.clamp(start, end + 1);
        let block = Self {
            start,
            current: AtomicU64::new(current),
            end: AtomicU64::new(end),
            status: AtomicU8::new(BlockStatus::Idle as u8),
            retries: AtomicU32::new(0),
            speed: AtomicU64::new(0),
        };
        if block.is_complete() {
            block.status.store(BlockStatus::Completed as u8, Ordering::Release);
        }
        block
    }

    /// First byte offset.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Next byte to write.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Last byte offset (inclusive).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Smoothed speed in bytes per second.
    #[must_use]
    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    /// True once every byte of the range is written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current() > self.end()
    }

    /// True when the range still ends at the unknown-size sentinel.
    #[must_use]
    pub fn has_unknown_end(&self) -> bool {
        self.end() == UNKNOWN_SIZE_END
    }

    /// Bytes written so far.
    #[must_use]
    pub fn progress(&self) -> u64 {
        let end_exclusive = self.end() + 1;
        self.current().min(end_exclusive) - self.start
    }

    /// Bytes still missing.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        (self.end() + 1).saturating_sub(self.current())
    }

    #[must_use]
    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            start: self.start,
            current: self.current(),
            end: self.end(),
            progress: self.progress(),
            status: self.status(),
            retries: self.retries(),
            speed: self.speed(),
        }
    }

    /// Stores `status` unless the block is already `Completed`.
    ///
    /// Returns whether the status was stored.
    pub(crate) fn set_status(&self, status: BlockStatus) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != BlockStatus::Completed as u8).then_some(status as u8)
            })
            .is_ok()
    }

    /// Advances `current` by `bytes`, never past `end + 1`. Returns the new position.
    pub(crate) fn advance(&self, bytes: u64) -> u64 {
        let limit = self.end() + 1;
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(bytes).min(limit))
            })
            .unwrap_or(limit);
        previous.saturating_add(bytes).min(limit)
    }

    /// Moves `current` back to `start` (single-stream restart without range support).
    pub(crate) fn rewind(&self) {
        self.current.store(self.start, Ordering::Release);
    }

    /// Records end of stream on an unknown-size block: the range ends at the last written byte.
    pub(crate) fn finish_at_current(&self) {
        let current = self.current();
        if current > self.start {
            self.end.store(current - 1, Ordering::Release);
        }
        self.status
            .store(BlockStatus::Completed as u8, Ordering::Release);
    }

    /// Marks the block complete at a size discovered after the fact.
    pub(crate) fn force_complete(&self, end_exclusive: u64) {
        if end_exclusive > self.start {
            self.end.store(end_exclusive - 1, Ordering::Release);
            self.current.store(end_exclusive, Ordering::Release);
        }
        self.status
            .store(BlockStatus::Completed as u8, Ordering::Release);
    }

    pub(crate) fn set_retries(&self, retries: u32) {
        self.retries.store(retries, Ordering::Relaxed);
    }

    pub(crate) fn set_speed(&self, bytes_per_second: u64) {
        self.speed.store(bytes_per_second, Ordering::Relaxed);
    }

    /// Hands the upper half of the remaining range to a new block.
    ///
    /// Only splits when more than `min_remaining` bytes are left. The owning
    /// worker sees the lowered `end` at its next chunk.
    pub(crate) fn split_remaining(&self, min_remaining: u64) -> Option<ByteRange> {
        let current = self.current();
        let end = self.end();
        if end == UNKNOWN_SIZE_END || current > end {
            return None;
        }
        let remaining = end + 1 - current;
        if remaining <= min_remaining {
            return None;
        }
        let mid = current + remaining / 2;
        self.end
            .compare_exchange(end, mid - 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(ByteRange { start: mid, end })
    }
}
