//! Range-aware and flaky wiremock responders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}

/// Parses `bytes=a-b` / `bytes=a-` against a body of `len` bytes.
pub fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(len.checked_sub(1)?),
    };
    Some((start, end))
}

/// Serves `body`, answering `Range` requests with 206 when `honor_ranges` is set.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    honor_ranges: bool,
    content_type: Option<&'static str>,
    delay: Option<Duration>,
    ranges: Arc<Mutex<Vec<String>>>,
    requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            honor_ranges: true,
            content_type: None,
            delay: None,
            ranges: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always answers 200 with the whole body.
    pub fn ignoring_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }

    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `Range` header values seen so far.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Mounts `GET path` with this responder and `HEAD path` answering 405,
    /// so the size is learned from a GET.
    pub async fn mount(&self, server: &MockServer, at: &str) {
        Mock::given(method("HEAD"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(405))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn template(&self, status: u16) -> ResponseTemplate {
        let mut template = ResponseTemplate::new(status);
        if self.honor_ranges {
            template = template.insert_header("Accept-Ranges", "bytes");
        }
        if let Some(content_type) = self.content_type {
            template = template.insert_header("Content-Type", content_type);
        }
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let Some(range) = range else {
            return self.template(200).set_body_bytes(self.body.as_slice());
        };
        if let Ok(mut ranges) = self.ranges.lock() {
            ranges.push(range.clone());
        }
        if !self.honor_ranges {
            return self.template(200).set_body_bytes(self.body.as_slice());
        }
        match parse_range(&range, len) {
            Some((start, end)) if start <= end => {
                let slice = &self.body[usize::try_from(start).unwrap_or(0)
                    ..=usize::try_from(end).unwrap_or(0)];
                self.template(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{len}").as_str())
                    .set_body_bytes(slice)
            }
            _ => self
                .template(416)
                .insert_header("Content-Range", format!("bytes */{len}").as_str()),
        }
    }
}

/// Answers the first `failures` requests with 503, then delegates.
pub struct FlakyResponder<R> {
    inner: R,
    failures: usize,
    seen: Arc<AtomicUsize>,
}

impl<R> FlakyResponder<R> {
    pub fn new(inner: R, failures: usize) -> Self {
        Self {
            inner,
            failures,
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<R: Respond> Respond for FlakyResponder<R> {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
            ResponseTemplate::new(503).insert_header("Retry-After", "0")
        } else {
            self.inner.respond(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_range;

    #[test]
    fn parse_range_forms() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=90-", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=90-500", 100), Some((90, 99)));
        assert_eq!(parse_range("items=0-1", 100), None);
    }
}
