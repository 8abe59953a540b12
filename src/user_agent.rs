//! User-Agent string for engine HTTP sessions.

/// Project URL advertised in the User-Agent (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/fierce/rangefetch";

/// Default User-Agent for download sessions.
///
/// Callers that pass their own `User-Agent` header (for example a browser
/// relay forwarding the original request headers) override this value.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("rangefetch/{version} (segmented-downloader; +{PROJECT_UA_URL})")
}
