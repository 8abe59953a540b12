//! Explicit configuration values for sessions and engines.
//!
//! Nothing in the library reads configuration from globals: a [`NetworkConfig`]
//! is handed to [`ConnectionManager`](crate::download::ConnectionManager) and an
//! [`EngineConfig`] to [`DownloadEngine::start`](crate::download::DownloadEngine::start).

use std::time::Duration;

use thiserror::Error;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS,
};

/// Lowest accepted concurrency hint.
pub const MIN_CONCURRENCY: usize = 1;

/// Highest accepted concurrency hint.
pub const MAX_CONCURRENCY: usize = 64;

/// Default concurrency hint when the caller does not pick one.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default per-block retry budget.
pub const DEFAULT_MAX_BLOCK_RETRIES: u32 = 8;

/// Errors reported by [`EngineConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Concurrency hint outside `MIN_CONCURRENCY..=MAX_CONCURRENCY`.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// A duration that must be non-zero was zero.
    #[error("invalid config value for `{field}`: must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A size or count that must be non-zero was zero.
    #[error("invalid config value for `{field}`: must be greater than zero")]
    ZeroValue {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The adaptive timeout ceiling is below the initial request timeout.
    #[error(
        "request timeout ceiling {ceiling_secs}s is below the initial request timeout {initial_secs}s"
    )]
    TimeoutCeilingTooLow {
        /// Configured initial timeout, in seconds.
        initial_secs: u64,
        /// Configured ceiling, in seconds.
        ceiling_secs: u64,
    },
}

/// Settings for building HTTP sessions.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Verify TLS certificates. Disabling is meant for self-signed test hosts.
    pub verify_tls: bool,
    /// Explicit proxy URL. `None` leaves the platform proxy settings in effect.
    pub proxy: Option<String>,
    /// Idle connections kept per host and shared by all blocks of a task.
    pub pool_max_idle_per_host: usize,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Initial timeout for receiving response headers and for each body read.
    pub request_timeout: Duration,
    /// Hard ceiling the adaptive request timeout may grow to.
    pub max_request_timeout: Duration,
    /// Transport-level retries for 429 and 5xx responses.
    pub transport_retries: u32,
    /// User-Agent override. Caller-supplied `User-Agent` headers take precedence.
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            verify_tls: true,
            proxy: None,
            pool_max_idle_per_host: 16,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_request_timeout: Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS),
            transport_retries: 3,
            user_agent: None,
        }
    }
}

/// Settings for one [`DownloadEngine`](crate::download::DownloadEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the number of blocks planned for a fresh download.
    pub max_concurrency: usize,
    /// Reduce the block count for small files.
    pub adaptive_concurrency: bool,
    /// Attempts per block before it fails with exhausted retries.
    pub max_block_retries: u32,
    /// First backoff delay of a block retry.
    pub backoff_base: Duration,
    /// Backoff ceiling of a block retry.
    pub backoff_cap: Duration,
    /// Add random jitter to block backoff delays.
    pub backoff_jitter: bool,
    /// Maximum bytes written per chunk (a cancellation point).
    pub chunk_size: usize,
    /// Progress monitor tick.
    pub monitor_interval: Duration,
    /// Number of monitor samples the smoothed speed is averaged over.
    pub speed_window: usize,
    /// Quiet period after which an unknown-size stream is treated as finished.
    pub stall_grace: Duration,
    /// Force completion when only a handful of bytes are missing.
    /// See [`near_completion`](crate::download::near_completion).
    pub near_completion: bool,
    /// Rewrite the resume sidecar on every monitor tick.
    pub persist_every_tick: bool,
    /// Split the largest remaining block when a worker finishes early.
    pub dynamic_split: bool,
    /// Smallest remaining range worth splitting.
    pub min_split_size: u64,
    /// Session settings.
    pub network: NetworkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY,
            adaptive_concurrency: true,
            max_block_retries: DEFAULT_MAX_BLOCK_RETRIES,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: true,
            chunk_size: 64 * 1024,
            monitor_interval: Duration::from_millis(500),
            speed_window: 10,
            stall_grace: Duration::from_secs(3),
            near_completion: true,
            persist_every_tick: true,
            dynamic_split: true,
            min_split_size: 10 * 1024 * 1024,
            network: NetworkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.max_concurrency,
            });
        }
        require_nonzero_duration("backoff_base", self.backoff_base)?;
        require_nonzero_duration("monitor_interval", self.monitor_interval)?;
        require_nonzero_duration("network.connect_timeout", self.network.connect_timeout)?;
        require_nonzero_duration("network.request_timeout", self.network.request_timeout)?;
        if self.max_block_retries == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_block_retries",
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroValue { field: "chunk_size" });
        }
        if self.speed_window == 0 {
            return Err(ConfigError::ZeroValue {
                field: "speed_window",
            });
        }
        if self.network.pool_max_idle_per_host == 0 {
            return Err(ConfigError::ZeroValue {
                field: "network.pool_max_idle_per_host",
            });
        }
        if self.network.max_request_timeout < self.network.request_timeout {
            return Err(ConfigError::TimeoutCeilingTooLow {
                initial_secs: self.network.request_timeout.as_secs(),
                ceiling_secs: self.network.max_request_timeout.as_secs(),
            });
        }
        Ok(())
    }
}

fn require_nonzero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency { value: 0 })
        );
    }

    #[test]
    fn test_validate_rejects_concurrency_over_max() {
        let config = EngineConfig {
            max_concurrency: 65,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency { value: 65 })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue { field: "chunk_size" })
        );
    }

    #[test]
    fn test_validate_rejects_ceiling_below_initial_timeout() {
        let mut config = EngineConfig::default();
        config.network.request_timeout = Duration::from_secs(60);
        config.network.max_request_timeout = Duration::from_secs(30);
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("30s"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_config_error_display_names_field() {
        let err = ConfigError::ZeroDuration {
            field: "monitor_interval",
        };
        assert!(err.to_string().contains("monitor_interval"));
    }
}
