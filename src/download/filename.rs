//! Filename derivation, sanitization, and path resolution for downloads.
//!
//! Names come from (in order) the caller, `Content-Disposition`, the final
//! URL's last path segment, and finally a synthetic `download_<timestamp>.<ext>`.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::constants::MAX_FILE_NAME_BYTES;

/// Guess file extension from Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "application/json" | "text/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "application/zip" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/x-7z-compressed" => ".7z",
        "application/vnd.android.package-archive" => ".apk",
        "text/css" => ".css",
        "text/javascript" | "application/javascript" => ".js",
        "video/mp4" => ".mp4",
        "audio/mpeg" => ".mp3",
        _ => ".bin",
    }
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles:
/// - `attachment; filename="example.iso"`
/// - `attachment; filename=example.iso`
/// - `attachment; filename*=UTF-8''example%20file.iso` (RFC 5987, preferred)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded_name)
                && !decoded.is_empty()
            {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = &stripped[..end];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim().trim_matches('\'');
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and control characters, and neutralizes dot segments.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Truncates a name to the filesystem limit, keeping the extension when it fits.
pub(crate) fn truncate_file_name(name: &str) -> String {
    if name.len() <= MAX_FILE_NAME_BYTES {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let ext = if ext.len() < MAX_FILE_NAME_BYTES / 2 {
        ext
    } else {
        ""
    };
    let budget = MAX_FILE_NAME_BYTES - ext.len();
    let mut cut = budget.min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{ext}", &stem[..cut])
}

/// Final on-disk name: sanitized, then truncated.
pub(crate) fn normalize_file_name(name: &str) -> String {
    truncate_file_name(&sanitize_filename(name))
}

/// Resolves a unique file path, adding numeric suffix if file exists.
///
/// `file.iso`, then `file_1.iso`, `file_2.iso`, ...
pub(crate) fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);

    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = split_extension(&filename);
    for i in 1..1000 {
        let new_path = dir.join(format!("{stem}_{i}{ext}"));
        if !new_path.exists() {
            return new_path;
        }
    }

    dir.join(format!("{stem}_{}{ext}", unix_timestamp()))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Splits `name.ext` into (`name`, `.ext`). Leading-dot names have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Percent-decoded last path segment of a URL, if it is non-empty.
pub(crate) fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(decoded)
}

/// Synthetic `download_<timestamp><ext>` name for responses with no usable name.
pub(crate) fn synthetic_file_name(content_type: Option<&str>) -> String {
    let extension = content_type.map_or(".bin", extension_from_content_type);
    format!("download_{}{extension}", unix_timestamp())
}

/// Name for API-like endpoints: the first path segment that is not `api`,
/// then the `name`/`type` query parameter, then the first query pair, then
/// the first host label, always with a `.json` extension.
pub(crate) fn api_file_name(url: &Url) -> String {
    let from_path = url
        .path_segments()
        .into_iter()
        .flatten()
        .find(|segment| !segment.is_empty() && !segment.eq_ignore_ascii_case("api"))
        .map(ToString::to_string);

    let from_query = || {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        ["name", "type"]
            .iter()
            .find_map(|key| {
                pairs
                    .iter()
                    .find(|(k, v)| k == key && !v.is_empty())
                    .map(|(_, v)| v.clone())
            })
            .or_else(|| pairs.first().map(|(k, v)| format!("{k}_{v}")))
    };

    let from_host = || {
        url.host_str()
            .and_then(|host| host.split('.').next())
            .filter(|label| !label.is_empty())
            .map(ToString::to_string)
    };

    let stem = from_path
        .or_else(from_query)
        .or_else(from_host)
        .unwrap_or_else(|| "api".to_string());
    format!("{}.json", sanitize_filename(&stem))
}

/// Corrected name when the response content type contradicts a generic extension.
///
/// Only names ending in `.bin` or with no extension are corrected, and only
/// to a known, non-generic extension. Returns `None` when nothing changes.
pub(crate) fn corrected_file_name(current: &str, content_type: &str) -> Option<String> {
    let new_ext = extension_from_content_type(content_type);
    if new_ext == ".bin" {
        return None;
    }
    let (stem, ext) = split_extension(current);
    if !(ext.is_empty() || ext.eq_ignore_ascii_case(".bin")) {
        return None;
    }
    Some(format!("{stem}{new_ext}"))
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
