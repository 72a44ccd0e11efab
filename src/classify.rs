//! Fatal vs retryable classification of a test run's output.
//!
//! A non-zero exit from the runner means one of two very different things:
//! tests executed and some failed (worth retrying), or the runner never got
//! far enough to run tests at all (bad arguments, build failure, no matching
//! tests). Only the captured output can tell them apart, and retrying the
//! latter kind can never succeed.

use regex::Regex;

/// How a failed invocation should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Tests ran and some failed; a filtered re-run makes sense.
    Retryable,
    /// The runner did not meaningfully execute tests; do not retry.
    Fatal,
}

/// Classifies captured stdout as [`Verdict::Fatal`] or [`Verdict::Retryable`].
pub struct OutputClassifier {
    adapter_marker: Regex,
    summary_line: Regex,
}

impl OutputClassifier {
    pub fn new() -> Self {
        Self {
            // Low-level test platform diagnostics look like ":VSTEST...:" or
            // "Microsoft.VSTestSdk:...:" and only appear once tests actually
            // execute under the adapter.
            adapter_marker: Regex::new(r":.*VSTEST.*:").unwrap(),
            // The human-readable tally the runner prints after executing
            // tests, with the fields in this literal order.
            summary_line: Regex::new(r"Failed:.*Passed:.*Skipped:.*Total:.*").unwrap(),
        }
    }

    /// Returns [`Verdict::Retryable`] iff the output carries either the test
    /// adapter marker or the summary line; anything else is [`Verdict::Fatal`].
    pub fn classify(&self, output: &str) -> Verdict {
        if self.adapter_marker.is_match(output) || self.summary_line.is_match(output) {
            Verdict::Retryable
        } else {
            Verdict::Fatal
        }
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new()
    }
}
