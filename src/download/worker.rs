//! Per-block download worker.
//!
//! A [`BlockWorker`] drives one [`DownloadBlock`] through
//! `Connecting → Downloading → Completed`, retrying transient failures with
//! backoff and checking for pause/stop at every chunk boundary.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, instrument, warn};

use super::block::{BlockStatus, DownloadBlock};
use super::client::Session;
use super::error::DownloadError;
use super::retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, retry_after_delay,
};

/// How a block asks the server for its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeMode {
    /// `Range: bytes={current}-{end}`; anything but a matching 206 rejects ranges.
    Ranged,
    /// One stream for the whole resource. When `resumable`, a retry after
    /// partial progress asks for `bytes={current}-`; otherwise it starts over.
    SingleStream { resumable: bool },
}

/// How a worker run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
    Completed,
    Cancelled,
    /// The server answered a ranged request without honoring the range.
    RangeRejected { status: u16 },
}

/// Block-level failure escalated to the engine.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The retry budget ran out on transient errors.
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: DownloadError,
    },

    /// An error that retrying cannot fix.
    #[error("{0}")]
    Fatal(#[source] DownloadError),
}

impl BlockError {
    /// The underlying download error.
    #[must_use]
    pub fn download_error(&self) -> &DownloadError {
        match self {
            Self::ExhaustedRetries { last, .. } => last,
            Self::Fatal(error) => error,
        }
    }
}

/// Why workers are being halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum HaltReason {
    None = 0,
    Paused = 1,
    Stopped = 2,
    /// The generation ended for another reason (completion, failure, mode change).
    Superseded = 3,
}

impl HaltReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Paused,
            2 => Self::Stopped,
            3 => Self::Superseded,
            _ => Self::None,
        }
    }
}

/// Cancellation shared by the workers and monitor of one run generation.
///
/// A child signal halts with its parent and reports the parent's reason
/// unless it was halted first on its own.
#[derive(Debug, Clone)]
pub(crate) struct HaltSignal {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
    parent_reason: Option<Arc<AtomicU8>>,
}

impl HaltSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(AtomicU8::new(HaltReason::None as u8)),
            parent_reason: None,
        }
    }

    pub(crate) fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(AtomicU8::new(HaltReason::None as u8)),
            parent_reason: Some(Arc::clone(&self.reason)),
        }
    }

    /// Halts the generation. The first reason wins.
    pub(crate) fn halt(&self, reason: HaltReason) {
        let _ = self.reason.compare_exchange(
            HaltReason::None as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.token.cancel();
    }

    pub(crate) fn reason(&self) -> HaltReason {
        match HaltReason::from_u8(self.reason.load(Ordering::Acquire)) {
            HaltReason::None => self
                .parent_reason
                .as_ref()
                .map_or(HaltReason::None, |parent| {
                    HaltReason::from_u8(parent.load(Ordering::Acquire))
                }),
            own => own,
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn halted(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// Content type announced by a single-stream response, kept for the rename at completion.
pub(crate) type SniffedContentType = Arc<Mutex<Option<String>>>;

enum Attempt {
    Finished,
    Cancelled,
    RangeRejected { status: u16 },
}

/// Downloads one block into the shared target file.
#[derive(Debug)]
pub(crate) struct BlockWorker {
    pub(crate) index: usize,
    pub(crate) block: Arc<DownloadBlock>,
    pub(crate) session: Session,
    pub(crate) url: String,
    pub(crate) path: PathBuf,
    pub(crate) mode: RangeMode,
    pub(crate) policy: RetryPolicy,
    pub(crate) chunk_size: usize,
    pub(crate) received: Arc<AtomicU64>,
    pub(crate) halt: HaltSignal,
    pub(crate) sniffed: SniffedContentType,
}

impl BlockWorker {
    /// Runs the block to completion, cancellation, range rejection or failure.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ExhaustedRetries`] when transient errors outlast the
    /// retry policy and [`BlockError::Fatal`] for errors retrying cannot fix.
    #[instrument(
        name = "block",
        skip(self),
        fields(block = self.index, start = self.block.start(), end = self.block.end())
    )]
    pub(crate) async fn run(self) -> Result<BlockOutcome, BlockError> {
        let mut attempt = 0u32;
        loop {
            if self.halt.is_halted() {
                return Ok(self.cancelled());
            }
            if self.block.is_complete() {
                self.block.set_status(BlockStatus::Completed);
                return Ok(BlockOutcome::Completed);
            }

            attempt += 1;
            self.block.set_status(BlockStatus::Connecting);
            let before = self.block.current();

            let error = match self.attempt().await {
                Ok(Attempt::Finished) => {
                    self.block.set_retries(0);
                    self.block.set_speed(0);
                    debug!(attempt, "block finished");
                    return Ok(BlockOutcome::Completed);
                }
                Ok(Attempt::Cancelled) => return Ok(self.cancelled()),
                Ok(Attempt::RangeRejected { status }) => {
                    self.block.set_status(BlockStatus::Stopped);
                    return Ok(BlockOutcome::RangeRejected { status });
                }
                Err(error) => error,
            };

            // retries count since the last attempt that moved the block forward
            if self.block.current() > before {
                attempt = 1;
            }

            let failure = classify_error(&error);
            if error.is_fatal_transport() || failure == FailureType::Permanent {
                self.block.set_status(BlockStatus::Failed);
                return Err(BlockError::Fatal(error));
            }

            match self.policy.should_retry(failure, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    let delay = retry_after_delay(&error).unwrap_or(delay);
                    self.block.set_retries(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "block attempt failed, retrying"
                    );
                    tokio::select! {
                        () = self.halt.halted() => return Ok(self.cancelled()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    self.block.set_status(BlockStatus::Failed);
                    debug!(%reason, "block not retried");
                    if failure == FailureType::NeedsAuth {
                        return Err(BlockError::Fatal(error));
                    }
                    return Err(BlockError::ExhaustedRetries {
                        attempts: attempt,
                        last: error,
                    });
                }
            }
        }
    }

    fn cancelled(&self) -> BlockOutcome {
        let status = match self.halt.reason() {
            HaltReason::Paused => BlockStatus::Paused,
            _ => BlockStatus::Stopped,
        };
        self.block.set_status(status);
        BlockOutcome::Cancelled
    }

    async fn attempt(&self) -> Result<Attempt, DownloadError> {
        let start = self.block.start();
        let current = self.block.current();
        let range = match self.mode {
            RangeMode::Ranged => Some(format!("bytes={current}-{}", self.block.end())),
            RangeMode::SingleStream { resumable: true } if current > start => {
                Some(format!("bytes={current}-"))
            }
            RangeMode::SingleStream { .. } => {
                if current > start {
                    debug!(discarded = current - start, "no range support, restarting stream");
                    self.block.rewind();
                }
                None
            }
        };

        let response = tokio::select! {
            () = self.halt.halted() => return Ok(Attempt::Cancelled),
            response = self.session.get(&self.url, range.as_deref()) => response,
        };
        let response = match response {
            Err(DownloadError::HttpStatus { status: 416, .. }) if self.mode == RangeMode::Ranged => {
                return Ok(Attempt::RangeRejected { status: 416 });
            }
            other => other?,
        };
        let status = response.status().as_u16();
        if (300..400).contains(&status) {
            // redirects were resolved up front; a late one is not followed
            return Err(DownloadError::http_status(&self.url, status));
        }

        let mut offset = self.block.current();
        if range.is_some() {
            let honored = status == 206 && content_range_start(&response) == Some(offset);
            if !honored {
                match self.mode {
                    RangeMode::Ranged => return Ok(Attempt::RangeRejected { status }),
                    RangeMode::SingleStream { .. } if (200..300).contains(&status) => {
                        debug!(status, "range ignored, rewriting from the start");
                        self.block.rewind();
                        offset = start;
                    }
                    RangeMode::SingleStream { .. } => {
                        return Err(DownloadError::http_status(&self.url, status));
                    }
                }
            }
        } else if !(200..300).contains(&status) {
            return Err(DownloadError::http_status(&self.url, status));
        }

        if matches!(self.mode, RangeMode::SingleStream { .. })
            && let Some(content_type) = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            && let Ok(mut sniffed) = self.sniffed.lock()
        {
            *sniffed = Some(content_type.to_string());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;

        self.block.set_status(BlockStatus::Downloading);
        let expected = self.block.remaining();
        let mut received_here = 0u64;
        let mut sample_at = Instant::now();
        let mut sample_pos = offset;
        let mut stream = std::pin::pin!(response.bytes_stream());

        loop {
            let next = tokio::select! {
                biased;
                () = self.halt.halted() => {
                    self.flush(&mut file).await?;
                    return Ok(Attempt::Cancelled);
                }
                next = self.session.next_chunk(&mut stream, &self.url) => next,
            };

            let Some(bytes) = next? else {
                self.flush(&mut file).await?;
                if self.block.has_unknown_end() {
                    self.block.finish_at_current();
                    return Ok(Attempt::Finished);
                }
                if self.block.is_complete() {
                    self.block.set_status(BlockStatus::Completed);
                    return Ok(Attempt::Finished);
                }
                return Err(DownloadError::interrupted(&self.url, expected, received_here));
            };

            for piece in bytes.chunks(self.chunk_size) {
                let remaining = self.block.remaining();
                let take = usize::try_from(remaining).map_or(piece.len(), |r| r.min(piece.len()));
                if take > 0 {
                    file.write_all(&piece[..take])
                        .await
                        .map_err(|e| DownloadError::io(&self.path, e))?;
                    let written = take as u64;
                    let position = self.block.advance(written);
                    self.received.fetch_add(written, Ordering::Relaxed);
                    received_here += written;

                    let elapsed = sample_at.elapsed();
                    if elapsed.as_secs() >= 1 {
                        let moved = position.saturating_sub(sample_pos);
                        let per_sec = u128::from(moved) * 1000 / elapsed.as_millis().max(1);
                        self.block.set_speed(u64::try_from(per_sec).unwrap_or(u64::MAX));
                        sample_at = Instant::now();
                        sample_pos = position;
                    }
                }

                if self.block.is_complete() {
                    self.flush(&mut file).await?;
                    self.block.set_status(BlockStatus::Completed);
                    return Ok(Attempt::Finished);
                }
                if self.halt.is_halted() {
                    self.flush(&mut file).await?;
                    return Ok(Attempt::Cancelled);
                }
            }
        }
    }

    async fn flush(&self, file: &mut File) -> Result<(), DownloadError> {
        file.flush()
            .await
            .map_err(|e| DownloadError::io(&self.path, e))
    }
}

/// First byte offset of a `Content-Range: bytes a-b/n` header.
fn content_range_start(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_start(value)
}

fn parse_content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, _) = rest.split_once('/').unwrap_or((rest, ""));
    let (first, _) = range.split_once('-')?;
    first.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::download::client::ConnectionManager;
    use crate::download::planner::ByteRange;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn worker(
        url: String,
        path: PathBuf,
        block: Arc<DownloadBlock>,
        mode: RangeMode,
    ) -> BlockWorker {
        let session = ConnectionManager::new(NetworkConfig {
            request_timeout: Duration::from_secs(5),
            transport_retries: 0,
            ..NetworkConfig::default()
        })
        .create_session(&HashMap::new())
        .unwrap();
        BlockWorker {
            index: 0,
            block,
            session,
            url,
            path,
            mode,
            policy: RetryPolicy::with_max_attempts(2).with_jitter(false),
            chunk_size: 16,
            received: Arc::new(AtomicU64::new(0)),
            halt: HaltSignal::new(),
            sniffed: Arc::new(Mutex::new(None)),
        }
    }

    #[test]
    fn test_parse_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(parse_content_range_start("bytes 0-0/*"), Some(0));
        assert_eq!(parse_content_range_start("items 1-2/3"), None);
    }

    #[test]
    fn test_halt_signal_keeps_first_reason() {
        let halt = HaltSignal::new();
        assert_eq!(halt.reason(), HaltReason::None);
        halt.halt(HaltReason::Paused);
        halt.halt(HaltReason::Stopped);
        assert!(halt.is_halted());
        assert_eq!(halt.reason(), HaltReason::Paused);
    }

    #[test]
    fn test_child_halt_follows_parent_but_not_back() {
        let parent = HaltSignal::new();
        let child = parent.child();
        child.halt(HaltReason::Superseded);
        assert!(child.is_halted());
        assert!(!parent.is_halted());

        let second = parent.child();
        parent.halt(HaltReason::Stopped);
        assert!(second.is_halted());
        assert_eq!(second.reason(), HaltReason::Stopped);
    }

    #[tokio::test]
    async fn test_ranged_block_writes_at_its_offset() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let data = payload(200);
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("range", "bytes=100-199"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 100-199/200")
                    .set_body_bytes(data[100..].to_vec()),
            )
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, vec![0u8; 200]).unwrap();
        let block = Arc::new(DownloadBlock::new(ByteRange {
            start: 100,
            end: 199,
        }));
        let w = worker(
            format!("{}/file", mock_server.uri()),
            target.clone(),
            Arc::clone(&block),
            RangeMode::Ranged,
        );
        let received = Arc::clone(&w.received);

        assert_eq!(w.run().await.unwrap(), BlockOutcome::Completed);
        assert!(block.is_complete());
        assert_eq!(block.status(), BlockStatus::Completed);
        assert_eq!(received.load(Ordering::Relaxed), 100);
        let written = std::fs::read(&target).unwrap();
        assert_eq!(&written[100..], &data[100..]);
        assert!(written[..100].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_ranged_block_reports_rejected_range_on_200() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(200)))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, vec![0u8; 200]).unwrap();
        let block = Arc::new(DownloadBlock::new(ByteRange { start: 0, end: 99 }));
        let w = worker(
            format!("{}/file", mock_server.uri()),
            target,
            Arc::clone(&block),
            RangeMode::Ranged,
        );
        assert_eq!(
            w.run().await.unwrap(),
            BlockOutcome::RangeRejected { status: 200 }
        );
        assert_eq!(block.current(), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_stream_finishes_at_eof() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/json")
                    .set_body_bytes(payload(1000)),
            )
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stream.bin");
        std::fs::write(&target, b"").unwrap();
        let block = Arc::new(DownloadBlock::unknown_size());
        let w = worker(
            format!("{}/stream", mock_server.uri()),
            target.clone(),
            Arc::clone(&block),
            RangeMode::SingleStream { resumable: false },
        );
        let sniffed = Arc::clone(&w.sniffed);

        assert_eq!(w.run().await.unwrap(), BlockOutcome::Completed);
        assert_eq!(block.end(), 999);
        assert_eq!(std::fs::read(&target).unwrap(), payload(1000));
        assert_eq!(
            sniffed.lock().unwrap().as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_not_found_is_fatal_without_retry() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing.bin");
        std::fs::write(&target, b"").unwrap();
        let block = Arc::new(DownloadBlock::unknown_size());
        let w = worker(
            format!("{}/missing", mock_server.uri()),
            target,
            Arc::clone(&block),
            RangeMode::SingleStream { resumable: false },
        );
        let err = w.run().await.unwrap_err();
        assert!(matches!(err, BlockError::Fatal(DownloadError::HttpStatus { status: 404, .. })));
        assert_eq!(block.status(), BlockStatus::Failed);
    }

    #[tokio::test]
    async fn test_persistent_503_exhausts_block_retries() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
            .expect(2)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("busy.bin");
        std::fs::write(&target, vec![0u8; 100]).unwrap();
        let block = Arc::new(DownloadBlock::new(ByteRange { start: 0, end: 99 }));
        let w = worker(
            format!("{}/busy", mock_server.uri()),
            target,
            Arc::clone(&block),
            RangeMode::Ranged,
        );
        let err = w.run().await.unwrap_err();
        assert!(matches!(
            err,
            BlockError::ExhaustedRetries {
                attempts: 2,
                last: DownloadError::HttpStatus { status: 503, .. }
            }
        ));
        assert_eq!(block.status(), BlockStatus::Failed);
        assert_eq!(block.retries(), 1);
        assert_eq!(block.current(), 0);
    }

    #[tokio::test]
    async fn test_halted_worker_marks_block_paused() {
        let dir = tempfile::tempdir().unwrap();
        let block = Arc::new(DownloadBlock::new(ByteRange { start: 0, end: 99 }));
        let w = worker(
            "http://127.0.0.1:9/never".to_string(),
            dir.path().join("x.bin"),
            Arc::clone(&block),
            RangeMode::Ranged,
        );
        w.halt.halt(HaltReason::Paused);
        assert_eq!(w.run().await.unwrap(), BlockOutcome::Cancelled);
        assert_eq!(block.status(), BlockStatus::Paused);
    }
}
