//! GitHub Actions step-summary rendering.
//!
//! When running inside a GitHub Actions job, `$GITHUB_STEP_SUMMARY` names a
//! file whose markdown content the runner displays on the job page. The
//! reporter appends one section per session; appending (rather than
//! overwriting) keeps summaries from other steps intact.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info};

use super::Reporter;
use crate::retry::{AttemptRecord, SessionOutcome};
use crate::summary::TestTally;

/// Appends a markdown session summary to the step-summary file.
pub struct GitHubSummaryReporter {
    path: PathBuf,
}

impl GitHubSummaryReporter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Builds the reporter when running under GitHub Actions.
    pub fn from_env() -> Option<Self> {
        std::env::var_os("GITHUB_STEP_SUMMARY").map(|path| Self::new(PathBuf::from(path)))
    }

    fn render(outcome: &SessionOutcome, tally: Option<&TestTally>) -> String {
        let mut md = String::from("## Test retry summary\n\n");

        match outcome {
            SessionOutcome::Success { attempts: 1 } => {
                md.push_str(":white_check_mark: All tests passed.\n");
            }
            SessionOutcome::Success { attempts } => {
                md.push_str(&format!(
                    ":white_check_mark: All tests passed after {attempts} attempts.\n"
                ));
            }
            SessionOutcome::FatalFailure { exit_code, .. } => {
                md.push_str(&format!(
                    ":x: The test runner failed to run tests (exit code {exit_code}).\n"
                ));
            }
            SessionOutcome::AttemptsExhausted { attempts, .. } => {
                md.push_str(&format!(
                    ":x: Tests still failing after {attempts} attempts.\n"
                ));
            }
            SessionOutcome::Cancelled { .. } => {
                md.push_str(":heavy_multiplication_x: Test run cancelled.\n");
            }
        }

        if let Some(tally) = tally {
            md.push_str("\n| Passed | Failed | Skipped | Total |\n");
            md.push_str("| ---: | ---: | ---: | ---: |\n");
            md.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                tally.passed, tally.failed, tally.skipped, tally.total
            ));

            if !tally.failed_tests.is_empty() {
                md.push_str("\nFailed tests:\n\n");
                for fqn in &tally.failed_tests {
                    md.push_str(&format!("- `{fqn}`\n"));
                }
            }
        }

        md.push('\n');
        md
    }
}

#[async_trait]
impl Reporter for GitHubSummaryReporter {
    async fn on_attempt_start(&self, _attempt: u32, _retrying: usize) {}

    async fn on_attempt_complete(&self, _record: &AttemptRecord) {}

    async fn on_session_complete(&self, outcome: &SessionOutcome, tally: Option<&TestTally>) {
        let markdown = Self::render(outcome, tally);

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(markdown.as_bytes()));

        match result {
            Ok(()) => info!("step summary written to {}", self.path.display()),
            Err(err) => error!("failed to write step summary: {err}"),
        }
    }
}
