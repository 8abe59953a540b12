//! Terminal rendering of engine events.

use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rangefetch_core::download::{EngineEvent, EngineState};
use tracing::warn;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({msg}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} ({msg})";

/// How events are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    /// Progress bar, or a spinner while the size is unknown.
    Bar,
    /// One JSON object per event on stdout.
    Json,
    /// Nothing but the logs.
    Silent,
}

pub(crate) struct ProgressView {
    mode: OutputMode,
    draw_target: fn() -> ProgressDrawTarget,
    bar: Option<ProgressBar>,
    has_length: bool,
}

impl ProgressView {
    pub(crate) fn new(mode: OutputMode) -> Self {
        Self::with_draw_target(mode, ProgressDrawTarget::stderr)
    }

    fn with_draw_target(mode: OutputMode, draw_target: fn() -> ProgressDrawTarget) -> Self {
        Self {
            mode,
            draw_target,
            bar: None,
            has_length: false,
        }
    }

    pub(crate) fn handle(&mut self, event: &EngineEvent) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(error) => warn!(%error, "failed to serialize event"),
            },
            OutputMode::Bar => self.render(event),
        }
    }

    fn render(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Initialized { .. } => {}
            EngineEvent::Progress {
                total_progress,
                file_size,
                ..
            } => {
                let bar = self.bar_for(*file_size);
                bar.set_position(*total_progress);
            }
            EngineEvent::Speed { bytes_per_second } => {
                if let Some(bar) = &self.bar {
                    bar.set_message(format!("{}/s", HumanBytes(*bytes_per_second)));
                }
            }
            EngineEvent::FileNameChanged { new_name } => {
                self.println(&format!("Saved as {new_name}"));
            }
            EngineEvent::Completed => {
                if let Some(bar) = &self.bar {
                    bar.finish_with_message("done");
                }
            }
            EngineEvent::Error { message } => {
                if let Some(bar) = &self.bar {
                    bar.abandon_with_message("failed");
                }
                eprintln!("Error: {message}");
            }
        }
    }

    /// The bar, created on first use and given a length once the size is known.
    fn bar_for(&mut self, file_size: Option<u64>) -> &ProgressBar {
        let draw_target = self.draw_target;
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::with_draw_target(None, draw_target());
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        if let (Some(size), false) = (file_size, self.has_length) {
            bar.set_length(size);
            bar.set_style(bar_style());
            self.has_length = true;
        }
        bar
    }

    pub(crate) fn println(&self, line: &str) {
        match (&self.bar, self.mode) {
            (_, OutputMode::Json | OutputMode::Silent) => {}
            (Some(bar), OutputMode::Bar) => bar.println(line),
            (None, OutputMode::Bar) => eprintln!("{line}"),
        }
    }

    /// Clears a bar that is still running, e.g. after Ctrl-C.
    pub(crate) fn finish(&self, state: EngineState) {
        if let Some(bar) = &self.bar
            && !bar.is_finished()
        {
            bar.abandon_with_message(state.as_str());
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
