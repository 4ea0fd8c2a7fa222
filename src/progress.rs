//! Progress display for stagehand runs

use colored::{ColoredString, Colorize};
use declarative::{Outcome, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};

/// Status symbol for a resource outcome
pub fn symbol(outcome: &Outcome) -> ColoredString {
    match outcome {
        Outcome::AlreadySatisfied => "○".dimmed(),
        Outcome::Applied => "✓".green(),
        Outcome::Planned => "~".yellow(),
        Outcome::Failed { .. } => "✗".red(),
        Outcome::SkippedDueToDependencyFailure { .. } | Outcome::SkippedDueToCancellation => {
            "⊘".yellow()
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Progress bar fed by the coordinator
///
/// Hidden when disabled; indicatif also hides it when stderr is not a
/// terminal.
pub struct RunProgress {
    enabled: bool,
    bar: Option<ProgressBar>,
}

impl RunProgress {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, bar: None }
    }
}

impl ProgressCallback for RunProgress {
    fn on_run_start(&mut self, total: usize) {
        if !self.enabled || total == 0 {
            return;
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(bar_style());
        bar.set_message("Applying");
        self.bar = Some(bar);
    }

    fn on_resource_start(&mut self, id: &str, description: &str) {
        log::debug!("starting {id}: {description}");
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} {}", "→".cyan(), id));
        }
    }

    fn on_resource_complete(&mut self, id: &str, outcome: &Outcome) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} {}", symbol(outcome), id));
            bar.inc(1);
        }
    }

    fn on_run_complete(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
