//! Progress indicators for the converge CLI

use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use declarative::{Action, ApplyResult, ProgressCallback};

/// Progress bar over every action applied in a run
///
/// Batches arrive one key at a time, so the bar grows as they start.
pub struct ApplyProgress {
    bar: ProgressBar,
    failed: usize,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = ProgressBar::new(0);
        if quiet {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar, failed: 0 }
    }

    pub fn finish(&self) {
        if self.failed == 0 {
            self.bar.finish_and_clear();
        } else {
            self.bar
                .finish_with_message(format!("{} failed", self.failed).red().to_string());
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_batch_start(&mut self, count: usize, _dry_run: bool) {
        self.bar.inc_length(count as u64);
    }

    fn on_action_start(&mut self, action: &Action) {
        self.bar.set_message(action.key().to_string());
    }

    fn on_action_complete(&mut self, action: &Action, result: &ApplyResult) {
        if let ApplyResult::Failed { error } = result {
            self.failed += 1;
            self.bar
                .println(format!("  {} {}: {}", "✗".red(), action.description(), error));
        }
        self.bar.inc(1);
    }

    fn on_batch_complete(&mut self) {}
}

/// Spinner for waiting on a submitted task
pub fn spinner(message: &str, quiet: bool) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if quiet {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb
}
