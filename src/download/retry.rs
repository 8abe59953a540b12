//! Retry logic with exponential backoff for transient transfer failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying download errors and determining retry behavior.
//!
//! # Overview
//!
//! When a request or a block transfer fails, the error is classified into a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - Authentication required (never retried)
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with optional jitter.
//!
//! # Example
//!
//! ```
//! use rangefetch_core::download::{
//!     DownloadError, RetryPolicy, FailureType, RetryDecision, classify_error
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/file.iso", 503);
//! let failure_type = classify_error(&error);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::constants::MAX_RETRY_AFTER;
use crate::config::{DEFAULT_MAX_BLOCK_RETRIES, EngineConfig};

/// Default maximum attempts for a block (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = DEFAULT_MAX_BLOCK_RETRIES;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Base delay of the transport-level retry inside a session.
const TRANSPORT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling of the transport-level retry inside a session.
const TRANSPORT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Classification of download failure types.
///
/// Used to determine whether a failed request should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeout, 5xx server errors, connection reset, truncated body.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, TLS failure, disk full.
    Permanent,

    /// Authentication or authorization required.
    NeedsAuth,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 8
/// - `base_delay`: 1 second
/// - `max_delay`: 60 seconds
/// - `backoff_multiplier`: 2.0
/// - `jitter`: enabled (up to 500ms)
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Whether random jitter is added on top of the capped delay.
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Block-level policy derived from an engine configuration.
    #[must_use]
    pub fn for_blocks(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_block_retries.max(1),
            base_delay: config.backoff_base,
            max_delay: config.backoff_cap,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: config.backoff_jitter,
        }
    }

    /// Short policy used by sessions to absorb 429/5xx responses.
    ///
    /// `retries` counts retries after the first attempt.
    #[must_use]
    pub fn for_transport(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            base_delay: TRANSPORT_BASE_DELAY,
            max_delay: TRANSPORT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }

    /// Returns a copy with jitter switched on or off.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed request.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - retry without credentials would not help"
                        .to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 = 2^0 = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter {
            Self::calculate_jitter()
        } else {
            Duration::ZERO
        };

        Duration::from_millis(capped_ms as u64) + jitter
    }

    /// Generates random jitter between 0 and `MAX_JITTER`.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter() -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a download error into a failure type for retry decisions.
///
/// # Non-HTTP Errors
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Network may recover |
/// | Interrupted | Transient | Resume from the last written byte |
/// | Network (most) | Transient | Server may come back |
/// | Network (TLS) / TlsOrProxy | Permanent | Certificate/proxy issue |
/// | Io | Permanent | Local file system issue |
/// | InvalidUrl / TooManyRedirects | Permanent | Won't succeed |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } | DownloadError::Interrupted { .. } => {
            FailureType::Transient
        }

        DownloadError::Network { source, .. } => {
            if is_tls_or_proxy_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::TlsOrProxy { .. }
        | DownloadError::InvalidProxy { .. }
        | DownloadError::ClientBuild { .. }
        | DownloadError::TooManyRedirects { .. } => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
///
/// Explicit match arms are used for each status code for documentation purposes,
/// even though some return the same value.
#[allow(clippy::match_same_arms)]
pub(crate) fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        407 => FailureType::NeedsAuth,   // Proxy Authentication Required
        408 => FailureType::Transient,   // Request Timeout
        410 => FailureType::Permanent,   // Gone
        429 => FailureType::RateLimited, // Too Many Requests

        500 => FailureType::Transient, // Internal Server Error
        502 => FailureType::Transient, // Bad Gateway
        503 => FailureType::Transient, // Service Unavailable
        504 => FailureType::Transient, // Gateway Timeout

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        // 3xx reaching a block worker means the resolved URL moved again
        _ => FailureType::Permanent,
    }
}

/// Statuses a session retries on its own before surfacing them.
pub(crate) fn is_transport_retry_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Checks if a reqwest error is a TLS, certificate or proxy failure.
pub(crate) fn is_tls_or_proxy_error(error: &reqwest::Error) -> bool {
    // reqwest does not expose TLS/proxy kinds; they only show up in the source chain text
    let mut text = error.to_string().to_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text.contains("certificate")
        || text.contains("tls")
        || text.contains("ssl")
        || text.contains("handshake")
        || text.contains("proxy")
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-dates. Values are capped at one hour and
/// dates in the past yield zero.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use rangefetch_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
        Ok(duration) => Some(duration),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    }
}

/// Retry-After delay carried by an HTTP status error, if it parses.
pub(crate) fn retry_after_delay(error: &DownloadError) -> Option<Duration> {
    match error {
        DownloadError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
        assert!(policy.jitter);
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_retry_policy_for_blocks_follows_engine_config() {
        let config = EngineConfig {
            max_block_retries: 4,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            backoff_jitter: false,
            ..EngineConfig::default()
        };
        let policy = RetryPolicy::for_blocks(&config);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(40));
        assert_eq!(policy.calculate_delay(7), Duration::from_millis(40));
    }

    #[test]
    fn test_retry_policy_for_transport_counts_first_attempt() {
        let policy = RetryPolicy::for_transport(3);
        assert_eq!(policy.max_attempts(), 4);
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_calculation_doubles_without_jitter() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(7), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_calculation_first_attempt_with_jitter() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);
        let delay = policy.calculate_delay(1);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1500));
    }

    #[test]
    fn test_delay_calculation_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    // ==================== Jitter Tests ====================

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            let jitter = RetryPolicy::calculate_jitter();
            assert!(
                jitter <= MAX_JITTER,
                "Jitter {} exceeds max",
                jitter.as_millis()
            );
        }
    }

    // ==================== Error Classification Tests ====================

    #[test]
    fn test_classify_http_404_permanent() {
        let error = DownloadError::http_status("http://example.com", 404);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_http_403_needs_auth() {
        let error = DownloadError::http_status("http://example.com", 403);
        assert_eq!(classify_error(&error), FailureType::NeedsAuth);
    }

    #[test]
    fn test_classify_http_429_rate_limited() {
        let error = DownloadError::http_status("http://example.com", 429);
        assert_eq!(classify_error(&error), FailureType::RateLimited);
    }

    #[test]
    fn test_classify_http_5xx_transient() {
        for status in [500, 502, 503, 504, 599] {
            let error = DownloadError::http_status("http://example.com", status);
            assert_eq!(classify_error(&error), FailureType::Transient, "{status}");
        }
    }

    #[test]
    fn test_classify_redirect_status_permanent() {
        let error = DownloadError::http_status("http://example.com", 302);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_timeout_and_interruption_transient() {
        let timeout = DownloadError::timeout("http://example.com", 30);
        let interrupted = DownloadError::interrupted("http://example.com", 10, 4);
        assert_eq!(classify_error(&timeout), FailureType::Transient);
        assert_eq!(classify_error(&interrupted), FailureType::Transient);
    }

    #[test]
    fn test_classify_io_error_permanent() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::io("/path/to/file", io_err);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_redirect_loop_permanent() {
        let error = DownloadError::too_many_redirects("http://example.com", 10);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_transport_retry_statuses() {
        assert!(is_transport_retry_status(429));
        assert!(is_transport_retry_status(503));
        assert!(!is_transport_retry_status(404));
        assert!(!is_transport_retry_status(501));
    }

    // ==================== Should Retry Decision Tests ====================

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("permanent"));
        } else {
            panic!("expected DoNotRetry, got {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);

        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));

        let decision = policy.should_retry(FailureType::Transient, 3);
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("exhausted"));
        } else {
            panic!("expected DoNotRetry, got {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_rate_limited_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::RateLimited, 1);
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_negative_ignored() {
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn test_parse_retry_after_capped_at_one_hour() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_http_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_future_http_date() {
        let future = std::time::SystemTime::now() + Duration::from_secs(120);
        let header = httpdate::fmt_http_date(future);
        let delay = parse_retry_after(&header).unwrap();
        assert!(delay <= Duration::from_secs(120));
        assert!(delay >= Duration::from_secs(100));
    }

    #[test]
    fn test_retry_after_delay_extracts_from_http_status() {
        let error = DownloadError::http_status_with_retry_after(
            "http://example.com",
            503,
            Some("7".to_string()),
        );
        assert_eq!(retry_after_delay(&error), Some(Duration::from_secs(7)));
        assert_eq!(
            retry_after_delay(&DownloadError::timeout("http://example.com", 1)),
            None
        );
    }
}
