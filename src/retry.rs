//! The retry state machine.
//!
//! A [`RetrySession`] drives repeated invocations of the test runner. Each
//! attempt either ends the session (success, fatal runner failure, attempts
//! exhausted, cancellation) or narrows the next invocation down to the tests
//! still believed failing.
//!
//! The failing set is seeded from the first attempt's report and only ever
//! pruned afterwards: an identity leaves the set when a fresh parse proves it
//! non-failed, and stays when it is absent from the report entirely — a test
//! that crashed the host before reporting must not be assumed passing.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classify::{OutputClassifier, Verdict};
use crate::invoker::{InvokeError, OutputCallback, TestInvoker};
use crate::report::Reporter;
use crate::trx::{self, TrxError};

/// Flag injected on retries so rebuilding cannot invalidate the results
/// directory produced by the previous attempt.
const NO_BUILD_FLAG: &str = "--no-build";

/// Settings for one retry session.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempt budget, first run included. Always at least 1.
    pub max_attempts: u32,
    /// The flat directory every attempt writes its TRX reports into.
    pub results_dir: PathBuf,
}

/// One completed attempt, for control flow and progress text only.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRecord {
    /// 1-based ordinal of the attempt.
    pub attempt: u32,
    /// Exit code of the attempt's invocation.
    pub exit_code: i32,
    /// Whether the attempt was classified fatal.
    pub fatal: bool,
}

/// Terminal state of a retry session, carrying the exit code to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// An attempt exited zero.
    Success { attempts: u32 },
    /// The runner did not meaningfully execute tests; retrying cannot help.
    /// Carries the captured output so the operator sees what happened.
    FatalFailure {
        attempts: u32,
        exit_code: i32,
        output: String,
    },
    /// The attempt budget ran out with tests still failing.
    AttemptsExhausted { attempts: u32, exit_code: i32 },
    /// The operator interrupted the in-flight attempt.
    Cancelled { attempts: u32 },
}

impl SessionOutcome {
    /// The process exit code this outcome maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Success { .. } => 0,
            SessionOutcome::FatalFailure { exit_code, .. } => *exit_code,
            SessionOutcome::AttemptsExhausted { exit_code, .. } => *exit_code,
            // Conventional SIGINT exit code.
            SessionOutcome::Cancelled { .. } => 130,
        }
    }

    /// Number of attempts the session used.
    pub fn attempts(&self) -> u32 {
        match self {
            SessionOutcome::Success { attempts }
            | SessionOutcome::FatalFailure { attempts, .. }
            | SessionOutcome::AttemptsExhausted { attempts, .. }
            | SessionOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success { .. })
    }
}

/// Errors that abort a session outright.
///
/// Cancellation and test failures are not errors — they surface as
/// [`SessionOutcome`] variants. What remains is the runner being unstartable
/// and report-parse invariant violations.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Trx(#[from] TrxError),
}

/// Drives repeated test-runner invocations until a terminal state.
pub struct RetrySession<I, R> {
    invoker: Arc<I>,
    reporter: Arc<R>,
    classifier: OutputClassifier,
    options: RetryOptions,
    args: Vec<String>,
    failing: BTreeSet<String>,
    observer: Option<OutputCallback>,
    cancel: CancellationToken,
}

impl<I, R> RetrySession<I, R>
where
    I: TestInvoker,
    R: Reporter,
{
    /// Creates a session over the given base arguments.
    ///
    /// The arguments should already carry the results-directory and TRX
    /// logger flags (see [`crate::invoker::ensure_reporting_args`]); the
    /// session passes them through verbatim apart from `--no-build`
    /// injection on retries.
    pub fn new(invoker: Arc<I>, reporter: Arc<R>, args: Vec<String>, options: RetryOptions) -> Self {
        Self {
            invoker,
            reporter,
            classifier: OutputClassifier::new(),
            options,
            args,
            failing: BTreeSet::new(),
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the per-line output observer handed to every invocation.
    pub fn with_observer(mut self, observer: OutputCallback) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the cancellation token that aborts the in-flight attempt.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The tests currently believed failing.
    pub fn failing(&self) -> &BTreeSet<String> {
        &self.failing
    }

    /// Runs attempts until a terminal state is reached.
    pub async fn run(&mut self) -> Result<SessionOutcome, RetryError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Only the first attempt may build; a rebuild on retry would be
            // wasted work and can clobber the just-written results.
            if attempt > 1 && !self.args.iter().any(|arg| arg == NO_BUILD_FLAG) {
                self.args.insert(0, NO_BUILD_FLAG.to_string());
            }

            self.reporter
                .on_attempt_start(attempt, self.failing.len())
                .await;

            let invocation = match self
                .invoker
                .invoke(&self.args, &self.failing, self.observer.clone(), &self.cancel)
                .await
            {
                Ok(invocation) => invocation,
                Err(InvokeError::Cancelled) => {
                    info!(attempt, "test run cancelled");
                    return Ok(SessionOutcome::Cancelled { attempts: attempt });
                }
                Err(err) => return Err(err.into()),
            };

            let mut record = AttemptRecord {
                attempt,
                exit_code: invocation.exit_code,
                fatal: false,
            };

            if invocation.success() {
                self.reporter.on_attempt_complete(&record).await;
                return Ok(SessionOutcome::Success { attempts: attempt });
            }

            if self.classifier.classify(&invocation.stdout) == Verdict::Fatal {
                record.fatal = true;
                self.reporter.on_attempt_complete(&record).await;
                return Ok(SessionOutcome::FatalFailure {
                    attempts: attempt,
                    exit_code: invocation.exit_code,
                    output: invocation.stdout,
                });
            }

            self.reporter.on_attempt_complete(&record).await;

            if attempt >= self.options.max_attempts {
                return Ok(SessionOutcome::AttemptsExhausted {
                    attempts: attempt,
                    exit_code: invocation.exit_code,
                });
            }

            let outcomes = trx::parse_outcomes(&self.options.results_dir)?;
            if attempt == 1 {
                // Seed: every identity the report marks failed.
                self.failing.extend(
                    outcomes
                        .iter()
                        .filter(|(_, outcome)| outcome.is_failed())
                        .map(|(fqn, _)| fqn.clone()),
                );
            } else {
                // Prune: drop identities the fresh report proves non-failed.
                // Identities with no fresh record stay in the set.
                self.failing
                    .retain(|fqn| outcomes.get(fqn).is_none_or(|outcome| outcome.is_failed()));
            }

            debug!(
                attempt,
                failing = self.failing.len(),
                "failing set updated for next attempt"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::invoker::RunInvocation;
    use crate::report::NullReporter;
    use crate::trx::testutil::{trx_document, write_trx};

    const SUMMARY: &str = "Failed: 1, Passed: 1, Skipped: 0, Total: 2, Duration: 1 s";

    /// One scripted invocation: the exit code and output to return, and the
    /// TRX records to drop into the results directory beforehand.
    struct ScriptedAttempt {
        exit_code: i32,
        stdout: &'static str,
        trx: Option<Vec<(&'static str, &'static str, &'static str)>>,
    }

    /// Replays a fixed script of attempts, recording what it was called with.
    struct FakeInvoker {
        results_dir: PathBuf,
        script: Mutex<VecDeque<ScriptedAttempt>>,
        calls: Mutex<Vec<(Vec<String>, BTreeSet<String>)>>,
    }

    impl FakeInvoker {
        fn new(results_dir: &Path, script: Vec<ScriptedAttempt>) -> Self {
            Self {
                results_dir: results_dir.to_path_buf(),
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Vec<String>, BTreeSet<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TestInvoker for FakeInvoker {
        async fn invoke(
            &self,
            args: &[String],
            failing: &BTreeSet<String>,
            _observer: Option<OutputCallback>,
            cancel: &CancellationToken,
        ) -> Result<RunInvocation, InvokeError> {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            let mut calls = self.calls.lock().unwrap();
            calls.push((args.to_vec(), failing.clone()));
            let attempt_index = calls.len();
            drop(calls);

            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("invoked more times than scripted");

            if let Some(records) = &step.trx {
                std::fs::create_dir_all(&self.results_dir).unwrap();
                // Later attempts write strictly newer files.
                let age = Duration::from_secs(1000 - attempt_index as u64 * 10);
                write_trx(
                    &self.results_dir,
                    &format!("attempt-{attempt_index}.trx"),
                    &trx_document(records),
                    age,
                );
            }

            Ok(RunInvocation {
                exit_code: step.exit_code,
                stdout: step.stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn session(
        invoker: Arc<FakeInvoker>,
        args: &[&str],
        max_attempts: u32,
        results_dir: &Path,
    ) -> RetrySession<FakeInvoker, NullReporter> {
        RetrySession::new(
            invoker,
            Arc::new(NullReporter),
            args.iter().map(|s| s.to_string()).collect(),
            RetryOptions {
                max_attempts,
                results_dir: results_dir.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success_performs_no_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![ScriptedAttempt {
                exit_code: 0,
                stdout: "Passed: 5, Total: 5",
                trx: None,
            }],
        ));

        let outcome = session(invoker.clone(), &["-c", "Release"], 3, dir.path())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Success { attempts: 1 });
        assert_eq!(outcome.exit_code(), 0);

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
        assert_eq!(calls[0].0, vec!["-c", "Release"]);
    }

    #[tokio::test]
    async fn test_failing_set_converges_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![
                        ("id-a", "Sample.Tests.A", "Failed"),
                        ("id-b", "Sample.Tests.B", "Failed"),
                        ("id-c", "Sample.Tests.C", "Passed"),
                    ]),
                },
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![
                        ("id-a", "Sample.Tests.A", "Passed"),
                        ("id-b", "Sample.Tests.B", "Failed"),
                    ]),
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &[], 3, dir.path());
        let outcome = session.run().await.unwrap();

        assert_eq!(outcome, SessionOutcome::Success { attempts: 3 });
        assert_eq!(outcome.exit_code(), 0);

        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].1.is_empty());
        assert_eq!(
            calls[1].1.iter().collect::<Vec<_>>(),
            ["Sample.Tests.A", "Sample.Tests.B"]
        );
        assert_eq!(calls[2].1.iter().collect::<Vec<_>>(), ["Sample.Tests.B"]);
        // The failing set never grows after seeding.
        assert!(calls[2].1.len() <= calls[1].1.len());
    }

    #[tokio::test]
    async fn test_no_build_injected_on_retries_only() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Failed")]),
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &["-c", "Release"], 3, dir.path());
        session.run().await.unwrap();

        let calls = invoker.calls();
        assert!(!calls[0].0.contains(&"--no-build".to_string()));
        assert_eq!(calls[1].0[0], "--no-build");
    }

    #[tokio::test]
    async fn test_no_build_not_duplicated_when_caller_passed_it() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Failed")]),
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &["--no-build"], 3, dir.path());
        session.run().await.unwrap();

        let calls = invoker.calls();
        let count = calls[1].0.iter().filter(|a| *a == "--no-build").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_fatal_output_stops_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![ScriptedAttempt {
                exit_code: 1,
                stdout: "MSBUILD : error MSB1009: Project file does not exist.",
                trx: None,
            }],
        ));

        let outcome = session(invoker.clone(), &[], 2, dir.path())
            .run()
            .await
            .unwrap();

        match outcome {
            SessionOutcome::FatalFailure {
                attempts,
                exit_code,
                ref output,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(exit_code, 1);
                assert!(output.contains("MSB1009"));
            }
            other => panic!("expected fatal failure, got {other:?}"),
        }
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_keeps_last_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Failed")]),
                },
                ScriptedAttempt {
                    exit_code: 2,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Failed")]),
                },
            ],
        ));

        let outcome = session(invoker.clone(), &[], 2, dir.path())
            .run()
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::AttemptsExhausted {
                attempts: 2,
                exit_code: 2
            }
        );
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(invoker.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_absent_identity_stays_failing() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![
                        ("id-a", "Sample.Tests.A", "Failed"),
                        ("id-b", "Sample.Tests.B", "Failed"),
                    ]),
                },
                // B crashed the host before reporting: only A has a record.
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Passed")]),
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &[], 3, dir.path());
        session.run().await.unwrap();

        let calls = invoker.calls();
        assert_eq!(calls[2].1.iter().collect::<Vec<_>>(), ["Sample.Tests.B"]);
    }

    #[tokio::test]
    async fn test_missing_results_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("never-created");
        let invoker = Arc::new(FakeInvoker::new(
            &results,
            vec![
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: None,
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &[], 3, &results);
        let outcome = session.run().await.unwrap();

        assert_eq!(outcome, SessionOutcome::Success { attempts: 2 });
        assert!(invoker.calls()[1].1.is_empty());
    }

    #[tokio::test]
    async fn test_empty_failing_set_does_not_imply_success() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(
            dir.path(),
            vec![
                // Reports say everything passed, yet the run exits non-zero.
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: Some(vec![("id-a", "Sample.Tests.A", "Passed")]),
                },
                ScriptedAttempt {
                    exit_code: 1,
                    stdout: SUMMARY,
                    trx: None,
                },
                ScriptedAttempt {
                    exit_code: 0,
                    stdout: "Passed: 1, Total: 1",
                    trx: None,
                },
            ],
        ));

        let mut session = session(invoker.clone(), &[], 3, dir.path());
        let outcome = session.run().await.unwrap();

        assert_eq!(outcome, SessionOutcome::Success { attempts: 3 });
        let calls = invoker.calls();
        assert!(calls.iter().all(|(_, failing)| failing.is_empty()));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(FakeInvoker::new(dir.path(), vec![]));

        let token = CancellationToken::new();
        token.cancel();

        let mut session =
            session(invoker.clone(), &[], 3, dir.path()).with_cancellation_token(token);
        let outcome = session.run().await.unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled { attempts: 1 });
        assert_eq!(outcome.exit_code(), 130);
        assert!(invoker.calls().is_empty());
    }
}
