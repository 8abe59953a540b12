//! Link resolution: final URL, file name and size before any block is planned.

use std::collections::HashMap;
use std::net::IpAddr;

use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderName, LOCATION,
};
use reqwest::{Method, Response};
use tracing::{debug, info, instrument};
use url::Url;

use super::client::{ConnectionManager, Session};
use super::constants::MAX_REDIRECTS;
use super::error::DownloadError;
use super::filename::{
    api_file_name, filename_from_url, normalize_file_name, parse_content_disposition,
    synthetic_file_name,
};

/// Optional pre-flight hint from an external CDN probe.
///
/// `resolved_ip` pins the URL's host to one address; `extra_headers` are sent
/// unless the caller supplied the same header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdnHint {
    pub resolved_ip: Option<IpAddr>,
    pub extra_headers: HashMap<String, String>,
}

/// What the server told us about a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    /// URL after redirects.
    pub final_url: String,
    /// Sanitized on-disk file name.
    pub file_name: String,
    /// Declared size; `None` when absent, zero, or not numeric.
    pub size: Option<u64>,
    pub content_type: Option<String>,
    /// The server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
    /// The URL looks like an API endpoint: single-shot, unknown size, not resumable.
    pub api_like: bool,
}

/// Builds the session for a download of `url`, applying the CDN hint if any.
///
/// # Errors
///
/// See [`ConnectionManager::create_session`].
pub fn session_for(
    manager: &ConnectionManager,
    url: &str,
    headers: &HashMap<String, String>,
    hint: Option<&CdnHint>,
) -> Result<Session, DownloadError> {
    let Some(hint) = hint else {
        return manager.create_session(headers);
    };

    let mut merged = hint.extra_headers.clone();
    for (name, value) in headers {
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        merged.insert(name.clone(), value.clone());
    }

    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string));
    match (hint.resolved_ip, host) {
        (Some(ip), Some(host)) => {
            debug!(%host, %ip, "pinning host to CDN address");
            manager.create_pinned_session(&merged, &host, ip)
        }
        _ => manager.create_session(&merged),
    }
}

/// Resolves URLs with a configured session.
#[derive(Debug, Clone)]
pub struct LinkResolver {
    session: Session,
}

impl LinkResolver {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Resolves `url` to its final location, a file name and a size.
    ///
    /// Tries HEAD first and falls back to GET (dropping the body unread) when
    /// HEAD fails or returns an error status. Redirects are followed by hand,
    /// at most [`MAX_REDIRECTS`] hops, with each `Location` cleaned before use.
    /// API-like URLs are answered without any request.
    ///
    /// File name precedence: `hint_filename`, `Content-Disposition`, last path
    /// segment of the final URL, then a synthetic name from the content type.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for malformed or non-HTTP URLs,
    /// [`DownloadError::TooManyRedirects`] for long chains, and the GET
    /// request's error when both HEAD and GET fail.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn resolve(
        &self,
        url: &str,
        hint_filename: Option<&str>,
    ) -> Result<ResolvedLink, DownloadError> {
        let parsed = parse_http_url(url)?;
        let hint = hint_filename
            .map(normalize_file_name)
            .filter(|name| !name.trim_matches('_').is_empty());

        if is_api_like(&parsed) {
            let file_name = hint.unwrap_or_else(|| api_file_name(&parsed));
            info!(%file_name, "API-like endpoint, size unknown");
            return Ok(ResolvedLink {
                final_url: url.to_string(),
                file_name,
                size: None,
                content_type: None,
                accepts_ranges: false,
                api_like: true,
            });
        }

        let (final_url, response) = match self.follow(Method::HEAD, &parsed).await {
            Ok((final_url, response)) if response.status().is_success() => (final_url, response),
            Ok((_, response)) => {
                debug!(status = response.status().as_u16(), "HEAD rejected, retrying with GET");
                self.follow(Method::GET, &parsed).await?
            }
            Err(error @ DownloadError::TooManyRedirects { .. }) => return Err(error),
            Err(error) => {
                debug!(%error, "HEAD failed, retrying with GET");
                self.follow(Method::GET, &parsed).await?
            }
        };

        let headers = response.headers();
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let content_type = text(CONTENT_TYPE);
        let size = text(CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&size| size > 0);
        let accepts_ranges = text(ACCEPT_RANGES)
            .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"));

        let file_name = hint
            .or_else(|| {
                text(CONTENT_DISPOSITION)
                    .and_then(|v| parse_content_disposition(&v))
                    .map(|name| normalize_file_name(&name))
            })
            .or_else(|| filename_from_url(&final_url).map(|name| normalize_file_name(&name)))
            .filter(|name| !name.trim_matches('_').is_empty())
            .unwrap_or_else(|| synthetic_file_name(content_type.as_deref()));
        drop(response);

        info!(
            final_url = %final_url,
            %file_name,
            size = ?size,
            accepts_ranges,
            "link resolved"
        );
        Ok(ResolvedLink {
            final_url: final_url.to_string(),
            file_name,
            size,
            content_type,
            accepts_ranges,
            api_like: false,
        })
    }

    async fn follow(&self, method: Method, start: &Url) -> Result<(Url, Response), DownloadError> {
        let mut current = start.clone();
        for hop in 0..=MAX_REDIRECTS {
            let response = if method == Method::GET {
                self.session.get(current.as_str(), None).await?
            } else {
                self.session.send(method.clone(), current.as_str(), &[]).await?
            };
            if !response.status().is_redirection() {
                return Ok((current, response));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .map(|value| value.as_bytes().to_vec());
            let Some(location) = location else {
                return Ok((current, response));
            };
            let next = resolve_location(&current, &location)?;
            debug!(hop, from = %current, to = %next, "following redirect");
            current = next;
        }
        Err(DownloadError::too_many_redirects(start.as_str(), MAX_REDIRECTS))
    }
}

fn parse_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url.trim()).map_err(|_| DownloadError::invalid_url(url))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DownloadError::invalid_url(url));
    }
    Ok(parsed)
}

/// Cleans a raw `Location` value and resolves it against `base`.
///
/// Only the first line is used and control characters are dropped.
fn resolve_location(base: &Url, raw: &[u8]) -> Result<Url, DownloadError> {
    let text = String::from_utf8_lossy(raw);
    let cleaned: String = text
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(DownloadError::invalid_url(text.into_owned()));
    }
    let next = base
        .join(cleaned)
        .map_err(|_| DownloadError::invalid_url(cleaned))?;
    if !matches!(next.scheme(), "http" | "https") {
        return Err(DownloadError::invalid_url(next.as_str()));
    }
    Ok(next)
}

/// A host label or path segment starting with `api` marks an API endpoint.
fn is_api_like(url: &Url) -> bool {
    let starts_with_api = |part: &str| part.to_ascii_lowercase().starts_with("api");
    let host_hit = url
        .host_str()
        .is_some_and(|host| host.split('.').any(starts_with_api));
    let path_hit = url
        .path_segments()
        .is_some_and(|mut segments| segments.any(starts_with_api));
    host_hit || path_hit
}
