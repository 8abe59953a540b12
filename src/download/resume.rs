//! Resume sidecar: a small binary file next to the download target.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! version:   u32
//! file_size: u64            (u64::MAX when the size is unknown)
//! url_len:   u32
//! url:       [u8; url_len]  (UTF-8)
//! blocks:    (start: u64, current: u64, end: u64) repeated until EOF
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::error::DownloadError;

/// Version written by this build and the only one accepted on load.
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Suffix appended to the target file name.
pub const RESUME_SUFFIX: &str = ".resume";

const UNKNOWN_SIZE_MARKER: u64 = u64::MAX;
const HEADER_LEN: usize = 4 + 8 + 4;
const TRIPLE_LEN: usize = 8 * 3;

/// Persisted `(start, current, end)` of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPositions {
    pub start: u64,
    pub current: u64,
    pub end: u64,
}

/// Decoded contents of a resume sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub version: u32,
    /// Total size, `None` when unknown.
    pub file_size: Option<u64>,
    /// URL the download was started with.
    pub url: String,
    pub blocks: Vec<BlockPositions>,
}

/// Reasons a sidecar could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResumeFormatError {
    #[error("resume data truncated: needed {needed} bytes, found {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported resume format version {found} (expected {RESUME_FORMAT_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("resume URL is not valid UTF-8")]
    InvalidUrl,

    #[error("resume data has {len} trailing bytes that do not form a block")]
    TrailingBytes { len: usize },

    #[error("resume block {index} has inconsistent positions ({start}, {current}, {end})")]
    InvalidBlock {
        index: usize,
        start: u64,
        current: u64,
        end: u64,
    },
}

impl ResumeRecord {
    /// A record in the current format version.
    #[must_use]
    pub fn new(url: impl Into<String>, file_size: Option<u64>, blocks: Vec<BlockPositions>) -> Self {
        Self {
            version: RESUME_FORMAT_VERSION,
            file_size,
            url: url.into(),
            blocks,
        }
    }

    /// Serializes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let url = self.url.as_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN + url.len() + self.blocks.len() * TRIPLE_LEN);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.file_size.unwrap_or(UNKNOWN_SIZE_MARKER).to_le_bytes());
        // urls longer than 4 GiB cannot come out of a real request line
        let url_len = u32::try_from(url.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&url_len.to_le_bytes());
        out.extend_from_slice(&url[..url_len as usize]);
        for block in &self.blocks {
            out.extend_from_slice(&block.start.to_le_bytes());
            out.extend_from_slice(&block.current.to_le_bytes());
            out.extend_from_slice(&block.end.to_le_bytes());
        }
        out
    }

    /// Parses a sidecar produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`ResumeFormatError`] for truncated data, an unknown version,
    /// a non-UTF-8 URL, trailing bytes, or a block with `current` outside
    /// `start..=end + 1`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ResumeFormatError> {
        let mut reader = Reader { bytes, offset: 0 };
        let version = reader.u32()?;
        if version != RESUME_FORMAT_VERSION {
            return Err(ResumeFormatError::UnsupportedVersion { found: version });
        }
        let raw_size = reader.u64()?;
        let url_len = reader.u32()? as usize;
        let url = String::from_utf8(reader.take(url_len)?.to_vec())
            .map_err(|_| ResumeFormatError::InvalidUrl)?;

        let rest = reader.remaining();
        if rest % TRIPLE_LEN != 0 {
            return Err(ResumeFormatError::TrailingBytes {
                len: rest % TRIPLE_LEN,
            });
        }

        let mut blocks = Vec::with_capacity(rest / TRIPLE_LEN);
        for index in 0..rest / TRIPLE_LEN {
            let start = reader.u64()?;
            let current = reader.u64()?;
            let end = reader.u64()?;
            if end < start || current < start || current > end.saturating_add(1) {
                return Err(ResumeFormatError::InvalidBlock {
                    index,
                    start,
                    current,
                    end,
                });
            }
            blocks.push(BlockPositions {
                start,
                current,
                end,
            });
        }

        Ok(Self {
            version,
            file_size: (raw_size != UNKNOWN_SIZE_MARKER).then_some(raw_size),
            url,
            blocks,
        })
    }

    /// True when the blocks tile `[0, file_size - 1]` exactly (or, for an
    /// unknown size, when there is exactly one block starting at 0).
    #[must_use]
    pub fn covers_whole_file(&self) -> bool {
        let mut sorted = self.blocks.clone();
        sorted.sort_by_key(|b| b.start);
        match self.file_size {
            None => sorted.len() == 1 && sorted[0].start == 0,
            Some(0) => false,
            Some(size) => {
                let mut expected_start = 0u64;
                for block in &sorted {
                    if block.start != expected_start {
                        return false;
                    }
                    expected_start = block.end + 1;
                }
                !sorted.is_empty() && expected_start == size
            }
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ResumeFormatError> {
        let available = self.remaining();
        if len > available {
            return Err(ResumeFormatError::Truncated {
                needed: len,
                available,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn u32(&mut self) -> Result<u32, ResumeFormatError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, ResumeFormatError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Reads and writes the sidecar of one download target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    /// Store for `<target>.resume`.
    #[must_use]
    pub fn for_target(target: &Path) -> Self {
        let mut name: OsString = target
            .file_name()
            .map_or_else(|| OsString::from("download"), ToOwned::to_owned);
        name.push(RESUME_SUFFIX);
        Self {
            path: target.with_file_name(name),
        }
    }

    /// Location of the sidecar.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the record, replacing any previous sidecar atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the temporary file cannot be written or renamed.
    pub fn save(&self, record: &ResumeRecord) -> Result<(), DownloadError> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        std::fs::write(&tmp_path, record.encode())
            .map_err(|e| DownloadError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| DownloadError::io(&self.path, e))?;
        debug!(path = %self.path.display(), blocks = record.blocks.len(), "resume record saved");
        Ok(())
    }

    /// Loads the sidecar. Missing or undecodable files yield `None`.
    #[must_use]
    pub fn load(&self) -> Option<ResumeRecord> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "cannot read resume record");
                return None;
            }
        };
        match ResumeRecord::decode(&bytes) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "discarding unreadable resume record");
                None
            }
        }
    }

    /// Loads the sidecar only if it belongs to this `url` and `file_size` and
    /// its blocks cover the file.
    #[must_use]
    pub fn load_matching(&self, url: &str, file_size: Option<u64>) -> Option<ResumeRecord> {
        let record = self.load()?;
        if record.url != url {
            warn!(stored = %record.url, requested = %url, "resume record is for another URL");
            return None;
        }
        if record.file_size != file_size {
            warn!(
                stored = ?record.file_size,
                resolved = ?file_size,
                "resume record size does not match the server"
            );
            return None;
        }
        if !record.covers_whole_file() {
            warn!(path = %self.path.display(), "resume record blocks do not cover the file");
            return None;
        }
        Some(record)
    }

    /// Removes the sidecar. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the file exists but cannot be removed.
    pub fn delete(&self) -> Result<(), DownloadError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(DownloadError::io(&self.path, error)),
        }
    }
}
