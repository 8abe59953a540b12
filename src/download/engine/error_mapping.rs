use crate::download::error::DownloadError;
use crate::download::worker::BlockError;

/// Coarse failure category, used to pick a suggestion for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FailureCategory {
    Network,
    Auth,
    NotFound,
    TlsOrProxy,
    Disk,
    BadUrl,
}

pub(super) fn classify_failure(error: &DownloadError) -> FailureCategory {
    match error {
        DownloadError::HttpStatus { status, .. } => match status {
            401 | 403 | 407 => FailureCategory::Auth,
            404 | 410 => FailureCategory::NotFound,
            _ => FailureCategory::Network,
        },
        DownloadError::InvalidUrl { .. } | DownloadError::TooManyRedirects { .. } => {
            FailureCategory::BadUrl
        }
        DownloadError::TlsOrProxy { .. }
        | DownloadError::InvalidProxy { .. }
        | DownloadError::ClientBuild { .. } => FailureCategory::TlsOrProxy,
        DownloadError::Io { .. } => FailureCategory::Disk,
        DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::Interrupted { .. } => FailureCategory::Network,
    }
}

/// Message carried by the `Error` event: the cause plus one hint.
pub(super) fn actionable_message(error: &DownloadError) -> String {
    let suggestion = match classify_failure(error) {
        FailureCategory::Network => {
            "Check network connectivity, then run again to continue from the resume file."
        }
        FailureCategory::Auth => {
            "The server refused access; pass the required cookies or tokens with --header."
        }
        FailureCategory::NotFound => "Verify the URL is still valid.",
        FailureCategory::TlsOrProxy => {
            "Check the proxy settings, or use --insecure for hosts with self-signed certificates."
        }
        FailureCategory::Disk => {
            "Free disk space or fix permissions; the partial file and resume data were kept."
        }
        FailureCategory::BadUrl => "Check the URL and any redirects it goes through.",
    };
    format!("{error}\n  Suggestion: {suggestion}")
}

pub(super) fn block_failure_message(error: &BlockError) -> String {
    match error {
        BlockError::ExhaustedRetries { attempts, last } => {
            let base = actionable_message(last);
            format!("gave up after {attempts} attempts: {base}")
        }
        BlockError::Fatal(error) => actionable_message(error),
    }
}
