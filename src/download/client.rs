//! HTTP session construction for the download engine.
//!
//! [`ConnectionManager`] turns a [`NetworkConfig`] plus the caller's request
//! headers into a [`Session`]: a pooled `reqwest` client shared by every block
//! of one task, with manual redirects, transport-level retry for 429/5xx, and
//! a request timeout that grows after repeated timeouts.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{
    ACCEPT, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, PRAGMA, RANGE, RETRY_AFTER,
};
use reqwest::{Client, Method, Proxy, Response};
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::retry::{
    RetryDecision, RetryPolicy, classify_error, is_tls_or_proxy_error, is_transport_retry_status,
    retry_after_delay,
};
use crate::config::NetworkConfig;
use crate::user_agent;

/// Builds configured HTTP sessions.
///
/// # Example
///
/// ```no_run
/// use std::collections::HashMap;
/// use rangefetch_core::config::NetworkConfig;
/// use rangefetch_core::download::ConnectionManager;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = ConnectionManager::new(NetworkConfig::default());
/// let session = manager.create_session(&HashMap::new())?;
/// # drop(session);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: NetworkConfig,
}

impl ConnectionManager {
    /// Creates a manager for the given network settings.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    /// Returns the network settings sessions are built from.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Creates a session sending `headers` with every request.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidProxy`] when the configured proxy is
    /// unusable, or [`DownloadError::ClientBuild`] if the client cannot be built.
    #[instrument(level = "debug", skip(self, headers), fields(header_count = headers.len()))]
    pub fn create_session(&self, headers: &HashMap<String, String>) -> Result<Session, DownloadError> {
        self.build_session(headers, None)
    }

    /// Creates a session whose connections to `host` go to `ip`, bypassing DNS.
    ///
    /// Used when an external CDN probe already picked the fastest edge address.
    ///
    /// # Errors
    ///
    /// Same as [`create_session`](Self::create_session).
    #[instrument(level = "debug", skip(self, headers))]
    pub fn create_pinned_session(
        &self,
        headers: &HashMap<String, String>,
        host: &str,
        ip: IpAddr,
    ) -> Result<Session, DownloadError> {
        self.build_session(headers, Some((host, ip)))
    }

    fn build_session(
        &self,
        headers: &HashMap<String, String>,
        pinned: Option<(&str, IpAddr)>,
    ) -> Result<Session, DownloadError> {
        let mut default_headers = build_header_map(headers);
        apply_default_headers(&mut default_headers);

        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(user_agent::default_download_user_agent);

        // user_agent first: a caller-supplied User-Agent in default_headers must win
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .default_headers(default_headers)
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none());

        if !self.config.verify_tls {
            warn!("TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(proxy_url) = self.config.proxy.as_deref() {
            let proxy =
                Proxy::all(proxy_url).map_err(|e| DownloadError::invalid_proxy(proxy_url, e))?;
            builder = builder.proxy(proxy);
        }

        if let Some((host, ip)) = pinned {
            // reqwest ignores the port here and uses the one from the request URL
            builder = builder.resolve(host, SocketAddr::new(ip, 0));
        }

        let client = builder.build().map_err(|e| match self.config.proxy.as_deref() {
            Some(proxy) => DownloadError::invalid_proxy(proxy, e),
            None => DownloadError::ClientBuild { source: e },
        })?;

        Ok(Session {
            client,
            timeout: Arc::new(AdaptiveTimeout::new(
                self.config.request_timeout,
                self.config.max_request_timeout,
            )),
            transport_policy: RetryPolicy::for_transport(self.config.transport_retries),
        })
    }
}

/// A configured HTTP session shared by all blocks of one download task.
///
/// Cloning is cheap and clones share the connection pool and the adaptive timeout.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    timeout: Arc<AdaptiveTimeout>,
    transport_policy: RetryPolicy,
}

impl Session {
    /// Timeout currently applied to response headers and to each body read.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.timeout.current()
    }

    /// Sends one request and returns the response whatever its status.
    ///
    /// No transport retry happens here. Redirects are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Timeout`] if headers do not arrive in time,
    /// [`DownloadError::TlsOrProxy`] for TLS/proxy failures, and
    /// [`DownloadError::Network`] for other connection failures.
    #[instrument(level = "debug", skip(self, extra_headers), fields(method = %method))]
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        extra_headers: &[(HeaderName, String)],
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.request(method, url);
        for (name, value) in extra_headers {
            request = request.header(name.clone(), value.as_str());
        }

        let timeout = self.timeout.current();
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => {
                if error.is_timeout() {
                    self.timeout.record_timeout();
                    Err(DownloadError::timeout(url, timeout.as_secs()))
                } else if is_tls_or_proxy_error(&error) {
                    Err(DownloadError::tls_or_proxy(url, error))
                } else {
                    Err(DownloadError::network(url, error))
                }
            }
            Err(_elapsed) => {
                self.timeout.record_timeout();
                Err(DownloadError::timeout(url, timeout.as_secs()))
            }
        }
    }

    /// Sends a GET, retrying 429/500/502/503/504 responses with backoff.
    ///
    /// A `Retry-After` header on a retried response replaces the computed delay.
    /// Responses below 400 (including 3xx) are returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for error statuses that are not
    /// retried or still fail after the transport retries, plus the errors of
    /// [`send`](Self::send).
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str, range: Option<&str>) -> Result<Response, DownloadError> {
        let extra: Vec<(HeaderName, String)> = range
            .map(|value| vec![(RANGE, value.to_string())])
            .unwrap_or_default();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = self.send(Method::GET, url, &extra).await?;
            let status = response.status().as_u16();
            if status < 400 {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let error = DownloadError::http_status_with_retry_after(url, status, retry_after);
            if !is_transport_retry_status(status) {
                return Err(error);
            }

            match self
                .transport_policy
                .should_retry(classify_error(&error), attempt)
            {
                RetryDecision::Retry { delay, .. } => {
                    let delay = retry_after_delay(&error).unwrap_or(delay);
                    debug!(
                        status,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "transport retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(status, %reason, "transport retries exhausted");
                    return Err(error);
                }
            }
        }
    }

    /// Reads the next body chunk, bounded by the adaptive request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Timeout`] when no data arrives in time and
    /// [`DownloadError::Network`] when the body stream fails.
    pub async fn next_chunk<S>(&self, stream: &mut S, url: &str) -> Result<Option<Bytes>, DownloadError>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let timeout = self.timeout.current();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(error))) if error.is_timeout() => {
                self.timeout.record_timeout();
                Err(DownloadError::timeout(url, timeout.as_secs()))
            }
            Ok(Some(Err(error))) => Err(DownloadError::network(url, error)),
            Ok(None) => Ok(None),
            Err(_elapsed) => {
                self.timeout.record_timeout();
                Err(DownloadError::timeout(url, timeout.as_secs()))
            }
        }
    }
}

/// Request timeout that grows by half after each timeout, up to a ceiling.
#[derive(Debug)]
struct AdaptiveTimeout {
    current_ms: AtomicU64,
    ceiling_ms: u64,
}

impl AdaptiveTimeout {
    fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling_ms = duration_millis(ceiling);
        Self {
            current_ms: AtomicU64::new(duration_millis(initial).min(ceiling_ms)),
            ceiling_ms,
        }
    }

    fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    fn record_timeout(&self) -> Duration {
        let ceiling = self.ceiling_ms;
        let previous = self
            .current_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current.saturating_add(current / 2)).min(ceiling))
            })
            .unwrap_or(ceiling);
        let next = previous.saturating_add(previous / 2).min(ceiling);
        if next != previous {
            info!(
                previous_ms = previous,
                next_ms = next,
                "request timed out, raising request timeout"
            );
        }
        Duration::from_millis(next)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reduces a raw header value to its first line without control characters.
fn clean_header_value(value: &str) -> String {
    value
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Converts caller headers, dropping names or values HTTP cannot carry.
fn build_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let Ok(header_name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            warn!(header = %name, "dropping header with invalid name");
            continue;
        };
        let cleaned = clean_header_value(value);
        let Ok(header_value) = HeaderValue::from_str(&cleaned) else {
            warn!(header = %name, "dropping header with invalid value");
            continue;
        };
        map.insert(header_name, header_value);
    }
    map
}

fn apply_default_headers(map: &mut HeaderMap) {
    let defaults = [
        (ACCEPT, "*/*"),
        (CACHE_CONTROL, "no-cache"),
        (PRAGMA, "no-cache"),
    ];
    for (name, value) in defaults {
        if !map.contains_key(&name) {
            map.insert(name, HeaderValue::from_static(value));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use reqwest::header::USER_AGENT;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn fast_config() -> NetworkConfig {
        NetworkConfig {
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_clean_header_value_keeps_first_line_only() {
        assert_eq!(clean_header_value("abc\r\nInjected: 1"), "abc");
        assert_eq!(clean_header_value("  a\u{1}b\t "), "ab");
    }

    #[test]
    fn test_build_header_map_drops_invalid_names() {
        let mut headers = HashMap::new();
        headers.insert("Bad Name".to_string(), "x".to_string());
        headers.insert("Cookie".to_string(), "a=1\nb=2".to_string());
        let map = build_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("cookie").unwrap(), "a=1");
    }

    #[test]
    fn test_apply_default_headers_keeps_caller_values() {
        let mut map = HeaderMap::new();
        map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));
        apply_default_headers(&mut map);
        assert_eq!(map.get(ACCEPT).unwrap(), "application/octet-stream");
        assert_eq!(map.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(map.get(PRAGMA).unwrap(), "no-cache");
    }

    #[test]
    fn test_adaptive_timeout_grows_and_caps() {
        let timeout = AdaptiveTimeout::new(Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(timeout.current(), Duration::from_secs(30));
        assert_eq!(timeout.record_timeout(), Duration::from_secs(45));
        assert_eq!(timeout.record_timeout(), Duration::from_secs(60));
        assert_eq!(timeout.record_timeout(), Duration::from_secs(60));
        assert_eq!(timeout.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_create_session_rejects_invalid_proxy() {
        let manager = ConnectionManager::new(NetworkConfig {
            proxy: Some("not a proxy url".to_string()),
            ..NetworkConfig::default()
        });
        let result = manager.create_session(&HashMap::new());
        assert!(matches!(result, Err(DownloadError::InvalidProxy { .. })));
    }

    #[test]
    fn test_create_session_with_tls_verification_disabled() {
        let manager = ConnectionManager::new(NetworkConfig {
            verify_tls: false,
            ..NetworkConfig::default()
        });
        assert!(manager.create_session(&HashMap::new()).is_ok());
    }

    #[test]
    fn test_session_get_rejects_malformed_url_without_retrying() {
        let session = ConnectionManager::new(fast_config())
            .create_session(&HashMap::new())
            .unwrap();
        let result = tokio_test::block_on(session.get("not-a-valid-url", None));
        assert!(matches!(result, Err(DownloadError::Network { .. })));
    }

    #[tokio::test]
    async fn test_session_sends_caller_and_default_headers() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("cache-control", "no-cache"))
            .and(header("x-token", "abc"))
            .and(header(USER_AGENT.as_str(), "custom-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());
        headers.insert("User-Agent".to_string(), "custom-agent".to_string());
        let session = ConnectionManager::new(fast_config())
            .create_session(&headers)
            .unwrap();

        let response = session
            .get(&format!("{}/file", mock_server.uri()), None)
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_session_get_retries_503_then_succeeds() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&mock_server)
            .await;

        let session = ConnectionManager::new(fast_config())
            .create_session(&HashMap::new())
            .unwrap();
        let response = session
            .get(&format!("{}/flaky", mock_server.uri()), None)
            .await
            .unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_session_get_does_not_retry_404() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let session = ConnectionManager::new(fast_config())
            .create_session(&HashMap::new())
            .unwrap();
        let result = session
            .get(&format!("{}/missing", mock_server.uri()), None)
            .await;
        match result {
            Err(DownloadError::HttpStatus { status, .. }) => assert_eq!(status, 404),
            other => panic!("Expected HttpStatus error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_get_returns_redirect_unfollowed() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
            .mount(&mock_server)
            .await;

        let session = ConnectionManager::new(fast_config())
            .create_session(&HashMap::new())
            .unwrap();
        let response = session
            .get(&format!("{}/moved", mock_server.uri()), None)
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 302);
    }

    #[tokio::test]
    async fn test_session_header_timeout_raises_request_timeout() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(600)))
            .mount(&mock_server)
            .await;

        let session = ConnectionManager::new(NetworkConfig {
            request_timeout: Duration::from_millis(200),
            max_request_timeout: Duration::from_millis(250),
            transport_retries: 0,
            ..NetworkConfig::default()
        })
        .create_session(&HashMap::new())
        .unwrap();

        let result = session
            .get(&format!("{}/slow", mock_server.uri()), None)
            .await;
        assert!(matches!(result, Err(DownloadError::Timeout { .. })));
        assert_eq!(session.request_timeout(), Duration::from_millis(250));
    }
}
