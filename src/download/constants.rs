//! Constants for the download module (timeouts, limits, sentinels).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Initial timeout for response headers and each body read (30 seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Ceiling for the adaptive request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Redirect hops followed by the link resolver before giving up.
pub const MAX_REDIRECTS: usize = 10;

/// Files at or below this size are never split (1 MiB).
pub const MIN_BLOCK_SIZE: u64 = 1024 * 1024;

/// Inclusive end offset of the single block covering an unknown-size stream.
///
/// One below `u64::MAX` so that `end + 1` never overflows.
pub const UNKNOWN_SIZE_END: u64 = u64::MAX - 1;

/// Longest file name written to disk, in bytes.
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Upper bound on the worker pool, before the per-core factor is applied.
pub const MAX_POOL_SIZE: usize = 32;

/// Grace window given to in-flight chunks on stop before workers are aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(2);
