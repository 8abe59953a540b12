//! Error types for the download module.
//!
//! This module defines structured errors for all network and file operations
//! performed by the engine, each carrying the URL or path it concerns.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving or transferring a resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused or reset).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// No response headers or body data arrived within the request timeout.
    #[error("timeout downloading {url} after {timeout_secs}s")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// Timeout in effect when the request gave up.
        timeout_secs: u64,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (429/503 responses).
        retry_after: Option<String>,
    },

    /// File system error on the destination or the resume sidecar.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL (or a redirect target) is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// TLS handshake, certificate or proxy tunnel failure.
    #[error("TLS/proxy error downloading {url}: {source}")]
    TlsOrProxy {
        /// The URL being fetched.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The configured proxy could not be used to build a session.
    #[error("invalid proxy configuration {proxy}: {source}")]
    InvalidProxy {
        /// The proxy URL as configured.
        proxy: String,
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP session: {source}")]
    ClientBuild {
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The redirect chain exceeded the hop limit.
    #[error("too many redirects ({hops}) starting from {url}")]
    TooManyRedirects {
        /// The URL the chain started from.
        url: String,
        /// Hops followed before giving up.
        hops: usize,
    },

    /// The response body ended before the requested range was delivered.
    #[error("transfer of {url} interrupted after {received} of {expected} bytes")]
    Interrupted {
        /// The URL being fetched.
        url: String,
        /// Bytes the range still required when the request was issued.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            url: url.into(),
            timeout_secs,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a TLS/proxy error.
    pub fn tls_or_proxy(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::TlsOrProxy {
            url: url.into(),
            source,
        }
    }

    /// Creates an invalid proxy error.
    pub fn invalid_proxy(proxy: impl Into<String>, source: reqwest::Error) -> Self {
        Self::InvalidProxy {
            proxy: proxy.into(),
            source,
        }
    }

    /// Creates a redirect-limit error.
    pub fn too_many_redirects(url: impl Into<String>, hops: usize) -> Self {
        Self::TooManyRedirects {
            url: url.into(),
            hops,
        }
    }

    /// Creates an interrupted-transfer error.
    pub fn interrupted(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::Interrupted {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Returns true for failures that must stop the whole engine immediately.
    #[must_use]
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            Self::TlsOrProxy { .. } | Self::InvalidProxy { .. } | Self::ClientBuild { .. }
        )
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs the url
// or path the source error lacks, so callers go through the constructors above.
