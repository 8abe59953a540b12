//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::app_config::FileConfig;
use rangefetch_core::config::{DEFAULT_CONCURRENCY, EngineConfig};
use rangefetch_core::download::DownloadRequest;

/// Download one file over HTTP in parallel byte ranges.
///
/// Interrupted downloads (Ctrl-C, network loss) leave a `.resume` file next
/// to the target; running the same command again continues from it.
#[derive(Parser, Debug)]
#[command(name = "rangefetch")]
#[command(author, version, about)]
pub(crate) struct Args {
    /// URL to download
    pub(crate) url: String,

    /// Directory to save into (default: current directory)
    #[arg(short = 'o', long)]
    pub(crate) output_dir: Option<PathBuf>,

    /// File name to save as (default: taken from the server)
    #[arg(short = 'n', long)]
    pub(crate) name: Option<String>,

    /// Number of parallel blocks (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub(crate) concurrency: Option<u8>,

    /// Use the full block count even for small files
    #[arg(long)]
    pub(crate) no_adaptive: bool,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub(crate) headers: Vec<(String, String)>,

    /// Expected file size in bytes, when the server does not report one
    #[arg(long)]
    pub(crate) size: Option<u64>,

    /// Proxy URL for all requests
    #[arg(long)]
    pub(crate) proxy: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub(crate) insecure: bool,

    /// Retries per block after the first attempt (0-20)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=20))]
    pub(crate) max_retries: Option<u8>,

    /// Disable the progress bar
    #[arg(long)]
    pub(crate) no_progress: bool,

    /// Print every engine event as a JSON line instead of a progress bar
    #[arg(long)]
    pub(crate) json: bool,

    /// Config file (default: $XDG_CONFIG_HOME/rangefetch/config.toml)
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub(crate) quiet: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(format!("expected \"Name: value\", got '{raw}'"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl Args {
    /// Engine settings: CLI flags, then the config file, then defaults.
    pub(crate) fn engine_config(&self, file: Option<&FileConfig>) -> EngineConfig {
        let file = file.cloned().unwrap_or_default();
        let defaults = EngineConfig::default();

        let mut network = defaults.network.clone();
        network.verify_tls = !self.insecure && file.verify_tls.unwrap_or(true);
        network.proxy = self.proxy.clone().or(file.proxy);
        if let Some(secs) = file.connect_timeout_secs {
            network.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.request_timeout_secs {
            network.request_timeout = Duration::from_secs(secs);
            network.max_request_timeout = network.max_request_timeout.max(network.request_timeout);
        }

        let max_concurrency = self
            .concurrency
            .or(file.concurrency)
            .map_or(DEFAULT_CONCURRENCY, usize::from);
        let max_block_retries = self
            .max_retries
            .or(file.max_retries)
            .map_or(defaults.max_block_retries, |retries| u32::from(retries) + 1);

        EngineConfig {
            max_concurrency,
            adaptive_concurrency: !self.no_adaptive && file.adaptive.unwrap_or(true),
            max_block_retries,
            network,
            ..defaults
        }
    }

    pub(crate) fn download_request(&self, file: Option<&FileConfig>) -> DownloadRequest {
        let save_dir = self
            .output_dir
            .clone()
            .or_else(|| file.and_then(|f| f.output_dir.clone()))
            .unwrap_or_else(|| PathBuf::from("."));
        let mut request = DownloadRequest::new(self.url.clone(), save_dir);
        for (name, value) in &self.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        if let Some(name) = &self.name {
            request = request.with_file_name(name.clone());
        }
        if let Some(size) = self.size {
            request = request.with_declared_size(size);
        }
        request
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/f.iso";

    #[test]
    fn test_cli_minimal_args() {
        let args = Args::try_parse_from(["rangefetch", URL]).unwrap();
        assert_eq!(args.url, URL);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.concurrency.is_none());
        assert!(args.headers.is_empty());
    }

    #[test]
    fn test_cli_url_is_required() {
        let err = Args::try_parse_from(["rangefetch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["rangefetch", "-vv", URL]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_concurrency_range() {
        let args = Args::try_parse_from(["rangefetch", "-c", "64", URL]).unwrap();
        assert_eq!(args.concurrency, Some(64));

        let err = Args::try_parse_from(["rangefetch", "-c", "0", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["rangefetch", "-c", "65", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_max_retries_over_max_rejected() {
        let err = Args::try_parse_from(["rangefetch", "-r", "21", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_headers_are_repeatable() {
        let args = Args::try_parse_from([
            "rangefetch",
            "-H",
            "Cookie: a=b; c=d",
            "--header",
            "Authorization:Bearer x",
            URL,
        ])
        .unwrap();
        assert_eq!(
            args.headers,
            vec![
                ("Cookie".to_string(), "a=b; c=d".to_string()),
                ("Authorization".to_string(), "Bearer x".to_string()),
            ]
        );
    }

    #[test]
    fn test_cli_rejects_malformed_header() {
        let err = Args::try_parse_from(["rangefetch", "-H", "no-colon", URL]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_engine_config_flags_override_file() {
        let args =
            Args::try_parse_from(["rangefetch", "-c", "3", "--insecure", "-r", "0", URL]).unwrap();
        let file = FileConfig {
            concurrency: Some(12),
            verify_tls: Some(true),
            proxy: Some("http://proxy:3128".to_string()),
            ..FileConfig::default()
        };
        let config = args.engine_config(Some(&file));
        assert_eq!(config.max_concurrency, 3);
        assert!(!config.network.verify_tls);
        assert_eq!(config.network.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.max_block_retries, 1);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_engine_config_defaults_without_file() {
        let args = Args::try_parse_from(["rangefetch", URL]).unwrap();
        let config = args.engine_config(None);
        assert_eq!(config.max_concurrency, DEFAULT_CONCURRENCY);
        assert!(config.adaptive_concurrency);
        assert!(config.network.verify_tls);
    }

    #[test]
    fn test_download_request_from_args() {
        let args = Args::try_parse_from([
            "rangefetch",
            "-n",
            "disk.img",
            "--size",
            "1000",
            "-H",
            "Referer: https://example.com/",
            URL,
        ])
        .unwrap();
        let file = FileConfig {
            output_dir: Some(PathBuf::from("/data")),
            ..FileConfig::default()
        };
        let request = args.download_request(Some(&file));
        assert_eq!(request.save_dir, PathBuf::from("/data"));
        assert_eq!(request.file_name.as_deref(), Some("disk.img"));
        assert_eq!(request.declared_size, Some(1000));
        assert_eq!(
            request.headers.get("Referer").map(String::as_str),
            Some("https://example.com/")
        );
    }
}
