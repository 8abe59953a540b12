//! CLI entry point for rangefetch.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use rangefetch_core::download::{DownloadEngine, EngineState};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress_manager;

use cli::Args;
use progress_manager::{OutputMode, ProgressView};

/// Exit status after Ctrl-C, as shells report SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn,
    // so log lines do not fight the progress bar)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info,rangefetch_core=debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?args, "CLI arguments parsed");

    let file_config = app_config::load_file_config(args.config.as_deref())?;
    let config = args.engine_config(file_config.as_ref());
    let request = args.download_request(file_config.as_ref());

    let mode = if args.json {
        OutputMode::Json
    } else if args.quiet || args.no_progress {
        OutputMode::Silent
    } else {
        OutputMode::Bar
    };
    let mut view = ProgressView::new(mode);

    let (engine, mut events) = DownloadEngine::start(request, config)?;
    let mut interrupted = false;
    let mut watch_ctrl_c = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                view.handle(&event);
                if event.is_terminal() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c(), if watch_ctrl_c => {
                if let Err(error) = signal {
                    warn!(%error, "cannot listen for Ctrl-C");
                    watch_ctrl_c = false;
                    continue;
                }
                interrupted = true;
                view.println("Interrupted, saving resume data...");
                if let Err(error) = engine.pause().await {
                    debug!(%error, "pause after Ctrl-C skipped");
                }
                engine.stop().await;
                break;
            }
        }
    }

    let state = engine.wait().await;
    view.finish(state);
    let snapshot = engine.snapshot();
    info!(%state, progress = snapshot.total_progress, "finished");

    Ok(match state {
        EngineState::Completed => {
            if let Some(path) = snapshot.path
                && mode == OutputMode::Bar
            {
                view.println(&format!("Downloaded {}", path.display()));
            }
            ExitCode::SUCCESS
        }
        EngineState::Stopped if interrupted => {
            view.println("Run the same command again to resume.");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        _ => ExitCode::FAILURE,
    })
}
