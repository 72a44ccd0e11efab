//! End-of-session tallies.
//!
//! After the retry session finishes, the results directory holds the
//! authoritative picture of the final state: the newest report per test is
//! what the last attempt produced. This module folds that picture into the
//! counts and failed-test list the rendering collaborators display, and into
//! the machine-readable session record behind `--json-summary`.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;

use crate::retry::SessionOutcome;
use crate::trx::{self, TestOutcome, TrxError};

/// Counts derived from the merged results directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestTally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Inconclusive/timeout/other statuses.
    pub other: usize,
    pub total: usize,
    /// Fully-qualified names of the tests still failing, sorted.
    pub failed_tests: Vec<String>,
    /// Wall-clock from the earliest TRX start to the latest finish.
    pub duration_secs: Option<f64>,
}

/// Tallies every `.trx` file in `dir` under the same merge rules the retry
/// engine uses, so the summary always agrees with the retry decisions.
pub fn tally_results(dir: &Path) -> Result<TestTally, TrxError> {
    let report = trx::parse_report(dir)?;

    let mut tally = TestTally::default();
    for (fqn, outcome) in &report.outcomes {
        tally.total += 1;
        match outcome {
            TestOutcome::Passed => tally.passed += 1,
            TestOutcome::Failed => {
                tally.failed += 1;
                tally.failed_tests.push(fqn.clone());
            }
            TestOutcome::Skipped => tally.skipped += 1,
            TestOutcome::Other => tally.other += 1,
        }
    }
    tally.failed_tests.sort();

    if let (Some(started), Some(finished)) = (report.started, report.finished) {
        tally.duration_secs = Some((finished - started).num_milliseconds() as f64 / 1000.0);
    }

    Ok(tally)
}

/// Machine-readable record of one finished session.
#[derive(Debug, Serialize)]
pub struct SessionRecord {
    #[serde(flatten)]
    pub outcome: SessionOutcome,
    /// The process exit code the outcome maps to.
    pub exit_code: i32,
    /// Tests still believed failing when the session ended.
    pub failing: Vec<String>,
    /// Final tally, when the results directory could be read.
    pub tally: Option<TestTally>,
}

impl SessionRecord {
    pub fn new(
        outcome: SessionOutcome,
        failing: &BTreeSet<String>,
        tally: Option<TestTally>,
    ) -> Self {
        let exit_code = outcome.exit_code();
        Self {
            outcome,
            exit_code,
            failing: failing.iter().cloned().collect(),
            tally,
        }
    }
}
