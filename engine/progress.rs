//! Terminal progress bars for the passes over a table.

use std::fmt;
use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Passes reported while reducing a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassStage {
    Moments,
    Sketch,
    PowerIteration,
    Projection,
    Incremental,
    Transform,
}

impl PassStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Moments => "feature moments",
            Self::Sketch => "range sketch",
            Self::PowerIteration => "power iteration",
            Self::Projection => "basis projection",
            Self::Incremental => "incremental fit",
            Self::Transform => "embedding transform",
        }
    }
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting row progress through each pass.
///
/// `total_rows` is `None` when the source cannot tell its length before a full scan.
pub trait PassProgressObserver {
    fn on_stage_start(&mut self, stage: PassStage, total_rows: Option<usize>) {
        let _ = (stage, total_rows);
    }
    fn on_stage_advance(&mut self, stage: PassStage, processed_rows: usize) {
        let _ = (stage, processed_rows);
    }
    fn on_stage_finish(&mut self, stage: PassStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl PassProgressObserver for NoopProgress {}

/// Terminal progress bars on stderr, one per pass.
#[derive(Default)]
pub struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create_progress_bar(len: Option<usize>, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(len.map(|n| n as u64), draw_target);
    let template = match len {
        Some(_) => "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows ({eta}) {msg}",
        None => "> [{elapsed_precise}] {spinner} {pos} rows {msg}",
    };
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

impl PassProgressObserver for ConsoleProgress {
    fn on_stage_start(&mut self, stage: PassStage, total_rows: Option<usize>) {
        if let Some(old) = self.bar.take() {
            old.finish_and_clear();
        }
        self.bar = Some(create_progress_bar(total_rows, stage.describe()));
    }

    fn on_stage_advance(&mut self, _stage: PassStage, processed_rows: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_rows as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: PassStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}
