//! Terminal rendering: a live spinner locally, plain line output in CI.
//!
//! CI log collectors garble in-place spinner updates, so under `CI=true`
//! every observed output line is printed verbatim instead. The switch is
//! purely cosmetic — retry behavior never depends on it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use super::Reporter;
use crate::invoker::OutputLine;
use crate::retry::{AttemptRecord, SessionOutcome};
use crate::summary::TestTally;

/// Renders attempt progress and the final summary to the terminal.
pub struct ConsoleReporter {
    ci: bool,
    state: Mutex<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    bar: Option<ProgressBar>,
    prefix: String,
}

impl ConsoleReporter {
    pub fn new(ci: bool) -> Self {
        Self {
            ci,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Handles one line of live runner output.
    ///
    /// Wired to the invoker's output callback: locally the line becomes the
    /// spinner's trailing message, in CI it is printed as-is.
    pub fn observe_line(&self, line: &OutputLine) {
        let OutputLine::Stdout(text) = line else {
            return;
        };

        if self.ci {
            println!("{text}");
            return;
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        let state = self.state.lock().unwrap();
        if let Some(bar) = state.bar.as_ref() {
            bar.set_message(format!("{}: {}", state.prefix, style(trimmed).dim()));
        }
    }

    fn render_tally(&self, tally: &TestTally) {
        println!();
        println!("Test results:");
        println!("  Passed:  {}", style(tally.passed).green());
        println!("  Failed:  {}", style(tally.failed).red());
        println!("  Skipped: {}", style(tally.skipped).yellow());
        println!("  Total:   {}", tally.total);
        if let Some(secs) = tally.duration_secs {
            println!("  Duration: {secs:.1} s");
        }

        if !tally.failed_tests.is_empty() {
            println!();
            println!("Failed tests:");
            for fqn in &tally.failed_tests {
                println!("  - {fqn}");
            }
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_attempt_start(&self, attempt: u32, retrying: usize) {
        let prefix = if attempt == 1 {
            "Running tests".to_string()
        } else {
            format!(
                "Retrying {retrying} failed test{}",
                if retrying == 1 { "" } else { "s" }
            )
        };

        if self.ci {
            println!("{prefix} (attempt #{attempt})");
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {wide_msg}")
                    .unwrap(),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar.set_message(prefix.clone());
            self.state.lock().unwrap().bar = Some(bar);
        }

        self.state.lock().unwrap().prefix = prefix;
    }

    async fn on_attempt_complete(&self, record: &AttemptRecord) {
        let (bar, prefix) = {
            let mut state = self.state.lock().unwrap();
            (state.bar.take(), state.prefix.clone())
        };
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        let mark = if record.exit_code == 0 {
            style("✔").green()
        } else {
            style("✘").red()
        };
        println!("{mark} {prefix} (attempt #{})", record.attempt);
    }

    async fn on_session_complete(&self, outcome: &SessionOutcome, tally: Option<&TestTally>) {
        match outcome {
            SessionOutcome::Success { attempts } => {
                if let Some(tally) = tally {
                    self.render_tally(tally);
                }
                println!();
                if *attempts == 1 {
                    println!("{}", style("All tests passed.").green().bold());
                } else {
                    println!(
                        "{}",
                        style(format!("All tests passed after {attempts} attempts."))
                            .green()
                            .bold()
                    );
                }
            }
            SessionOutcome::FatalFailure { output, .. } => {
                println!("{} Failed to run tests.", style("error:").red().bold());
                println!("{output}");
            }
            SessionOutcome::AttemptsExhausted { attempts, .. } => {
                if let Some(tally) = tally {
                    self.render_tally(tally);
                }
                println!();
                println!(
                    "{}",
                    style(format!("Tests still failing after {attempts} attempts."))
                        .red()
                        .bold()
                );
            }
            SessionOutcome::Cancelled { .. } => {
                println!();
                println!("{}", style("Test run cancelled.").yellow().bold());
            }
        }
    }
}
