//! Terminal output for batch runs: a live progress bar, summary lines, and a
//! stderr writer which doesn't scribble over the bar.
//!
//! The progress bar handling is adapted from `substudy` by Eric Kidd, which is
//! licensed under Apache-2.0 OR MIT. Used with permission.

use std::{
    io::{self, Write as _},
    time::Duration,
};

use batch_proofer::scheduler::RunCounters;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: MultiProgress,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: MultiProgress::new(),
        }
    }

    /// Hide all progress output, for when results go to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A writer for `tracing` which suspends progress bars while it writes.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Start a progress bar for a run over `total_files` files.
    pub fn run_progress(&self, total_files: usize) -> RunProgressBar {
        let pb = ProgressBar::new(total_files as u64).with_style(run_style());
        let pb = self.multi_progress.add(pb);
        pb.set_prefix("📄");
        pb.set_message(status_line(&RunCounters::default()));
        pb.enable_steady_tick(Duration::from_millis(250));
        RunProgressBar { pb }
    }

    /// Print a one-line message to stderr, above any progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.multi_progress
            .suspend(|| eprintln!("  {emoji:3}{msg}"));
    }
}

/// The progress bar for a batch run, driven by the engine's run counters.
pub struct RunProgressBar {
    pb: ProgressBar,
}

impl RunProgressBar {
    /// Show the latest counters. Files added mid-run grow the bar.
    pub fn update(&self, counters: &RunCounters) {
        self.pb.set_length(counters.total_files as u64);
        self.pb
            .set_position((counters.completed + counters.failed) as u64);
        self.pb.set_message(status_line(counters));
    }

    /// Show the final counters and leave the bar on screen.
    pub fn finish(&self, counters: &RunCounters, interrupted: bool) {
        self.update(counters);
        if interrupted {
            self.pb.abandon_with_message(format!(
                "{} (stopped)",
                status_line(counters)
            ));
        } else {
            self.pb.finish();
        }
    }
}

/// A short summary of where a run is, like "3 ok, 1 failed, 2 retried".
fn status_line(counters: &RunCounters) -> String {
    let mut line = format!("{} ok", counters.completed);
    if counters.failed > 0 {
        line.push_str(&format!(", {} failed", counters.failed));
    }
    if counters.retried > 0 {
        line.push_str(&format!(", {} retried", counters.retried));
    }
    line
}

fn run_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {msg}")
        .expect("bad progress bar template")
}

/// Writes to `stderr`, hiding progress bars while it does.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_omits_zero_counts() {
        let mut counters = RunCounters {
            total_files: 5,
            completed: 3,
            ..RunCounters::default()
        };
        assert_eq!(status_line(&counters), "3 ok");
        counters.failed = 1;
        counters.retried = 2;
        assert_eq!(status_line(&counters), "3 ok, 1 failed, 2 retried");
    }
}
