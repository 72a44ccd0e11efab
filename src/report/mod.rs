//! Progress and summary rendering.
//!
//! The retry engine reports lifecycle events through the [`Reporter`] seam
//! and never renders anything itself. Attempt-by-attempt progress and the
//! final summary are entirely the reporters' business, which is why a CI
//! environment can change how things look without touching retry logic.

pub mod console;
pub mod github;

use async_trait::async_trait;

use crate::retry::{AttemptRecord, SessionOutcome};
use crate::summary::TestTally;

pub use console::ConsoleReporter;
pub use github::GitHubSummaryReporter;

/// Receives retry-session lifecycle events.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called before an attempt's invocation starts. `retrying` is the size
    /// of the failing set the attempt is filtered down to (0 on the first
    /// attempt, or when a full re-run is needed).
    async fn on_attempt_start(&self, attempt: u32, retrying: usize);

    /// Called when an attempt's invocation has exited.
    async fn on_attempt_complete(&self, record: &AttemptRecord);

    /// Called once, after the session reached a terminal state.
    async fn on_session_complete(&self, outcome: &SessionOutcome, tally: Option<&TestTally>);
}

#[async_trait]
impl<R: Reporter + ?Sized> Reporter for std::sync::Arc<R> {
    async fn on_attempt_start(&self, attempt: u32, retrying: usize) {
        (**self).on_attempt_start(attempt, retrying).await;
    }

    async fn on_attempt_complete(&self, record: &AttemptRecord) {
        (**self).on_attempt_complete(record).await;
    }

    async fn on_session_complete(&self, outcome: &SessionOutcome, tally: Option<&TestTally>) {
        (**self).on_session_complete(outcome, tally).await;
    }
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_attempt_start(&self, _attempt: u32, _retrying: usize) {}
    async fn on_attempt_complete(&self, _record: &AttemptRecord) {}
    async fn on_session_complete(&self, _outcome: &SessionOutcome, _tally: Option<&TestTally>) {}
}

/// A reporter that fans events out to multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_attempt_start(&self, attempt: u32, retrying: usize) {
        for reporter in &self.reporters {
            reporter.on_attempt_start(attempt, retrying).await;
        }
    }

    async fn on_attempt_complete(&self, record: &AttemptRecord) {
        for reporter in &self.reporters {
            reporter.on_attempt_complete(record).await;
        }
    }

    async fn on_session_complete(&self, outcome: &SessionOutcome, tally: Option<&TestTally>) {
        for reporter in &self.reporters {
            reporter.on_session_complete(outcome, tally).await;
        }
    }
}
