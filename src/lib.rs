//! retest: runs `dotnet test` and retries only what failed.
//!
//! Flaky tests fail CI runs that would otherwise pass. This crate wraps the
//! test runner in a retry session: after a failed attempt it reads the TRX
//! reports the runner produced, keeps the set of tests still failing, and
//! re-runs just those until they pass, the runner fails outright, or the
//! attempt budget is exhausted.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Invoker**: Runs the external `dotnet test` process, streaming output
//! - **TRX parser**: Folds report files into per-test outcomes
//! - **Retry session**: The state machine deciding what to re-run next
//! - **Classifier**: Tells "tests failed" apart from "runner failed"
//! - **Reporters**: Progress and summary rendering (console, GitHub)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use retest::report::NullReporter;
//! use retest::retry::{RetryOptions, RetrySession};
//! use retest::invoker::DotnetInvoker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let invoker = Arc::new(DotnetInvoker::new("dotnet"));
//!     let options = RetryOptions {
//!         max_attempts: 4,
//!         results_dir: std::env::temp_dir().join("retest-results"),
//!     };
//!     let args = vec!["--logger".to_string(), "trx".to_string()];
//!     let mut session = RetrySession::new(invoker, Arc::new(NullReporter), args, options);
//!     let outcome = session.run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod classify;
pub mod config;
pub mod invoker;
pub mod muxer;
pub mod report;
pub mod retry;
pub mod summary;
pub mod trx;

// Re-export commonly used types
pub use classify::{OutputClassifier, Verdict};
pub use config::{Config, load_optional_config};
pub use invoker::{DotnetInvoker, OutputCallback, OutputLine, RunInvocation, TestInvoker};
pub use report::Reporter;
pub use retry::{RetryOptions, RetrySession, SessionOutcome};
pub use trx::{TestOutcome, parse_outcomes};
