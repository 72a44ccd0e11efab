//! Invocation of the external `dotnet test` process.
//!
//! The invoker runs the test host exactly once per attempt. Its contract is
//! deliberately narrow: assemble the argument list (filter first, then the
//! caller's arguments, with the `test` subcommand ahead of everything),
//! stream stdout line-by-line to an observer while also accumulating it, and
//! hand back the exit code. A non-zero exit is a normal, meaningful result
//! here, never an `Err` — classification happens elsewhere.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The test-execution subcommand prepended to every invocation.
const TEST_SUBCOMMAND: &str = "test";

/// A line of output from the running child process.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Callback invoked for each line of child output as it is produced.
///
/// The invoker makes no assumption about what the observer does with each
/// line; rendering collaborators use it to update a progress display.
pub type OutputCallback = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Result of one completed invocation.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    /// The child's exit code (-1 if terminated by a signal).
    pub exit_code: i32,
    /// Full captured standard output.
    pub stdout: String,
    /// Full captured standard error.
    pub stderr: String,
}

impl RunInvocation {
    /// Whether the invocation exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised while starting or observing the child process.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for the test runner")]
    Wait(#[from] std::io::Error),

    #[error("test run was cancelled")]
    Cancelled,
}

/// Executes one test-runner invocation.
///
/// The trait seam exists so the retry controller can be driven by a scripted
/// fake in tests; [`DotnetInvoker`] is the real implementation.
#[async_trait]
pub trait TestInvoker: Send + Sync {
    /// Runs the test host once with `args`, filtered down to `failing` when
    /// that set is non-empty.
    async fn invoke(
        &self,
        args: &[String],
        failing: &BTreeSet<String>,
        observer: Option<OutputCallback>,
        cancel: &CancellationToken,
    ) -> Result<RunInvocation, InvokeError>;
}

/// Builds the final argument list for one attempt.
///
/// A non-empty failing set becomes a single `--filter` expression of
/// OR-combined substring matches, placed ahead of the caller's arguments;
/// the `test` subcommand goes ahead of everything. The caller's arguments
/// pass through verbatim.
pub fn build_test_args(args: &[String], failing: &BTreeSet<String>) -> Vec<String> {
    let mut assembled = Vec::with_capacity(args.len() + 3);
    assembled.push(TEST_SUBCOMMAND.to_string());

    if !failing.is_empty() {
        let filter = failing
            .iter()
            .map(|fqn| format!("FullyQualifiedName~{fqn}"))
            .collect::<Vec<_>>()
            .join("|");
        assembled.push("--filter".to_string());
        assembled.push(filter);
    }

    assembled.extend(args.iter().cloned());
    assembled
}

/// What the caller-supplied arguments already request.
///
/// The retry engine needs the runner to emit TRX reports into one known
/// directory; callers may or may not have asked for that themselves.
#[derive(Debug, Default, Clone)]
pub struct ArgScan {
    /// Any `--logger`/`-l` option is present.
    pub has_logger: bool,
    /// A logger option naming `trx` is present.
    pub trx_logger: bool,
    /// The value of `--results-directory`, when present.
    pub results_directory: Option<String>,
}

impl ArgScan {
    /// Scans base arguments, accepting both `--opt value` and `--opt=value`
    /// spellings (and `-l` for the logger).
    pub fn scan(args: &[String]) -> Self {
        let mut scan = ArgScan::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if let Some(value) = option_value(arg, &mut iter, &["--logger", "-l"]) {
                scan.has_logger = true;
                if value.starts_with("trx") {
                    scan.trx_logger = true;
                }
            } else if let Some(value) = option_value(arg, &mut iter, &["--results-directory"]) {
                scan.results_directory = Some(value);
            }
        }
        scan
    }
}

fn option_value<'a, I>(arg: &str, iter: &mut I, names: &[&str]) -> Option<String>
where
    I: Iterator<Item = &'a String>,
{
    for name in names {
        if arg == *name {
            return iter.next().cloned();
        }
        if let Some(rest) = arg.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix('=').or_else(|| rest.strip_prefix(':')) {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Prepends `--results-directory` and `--logger trx` when the caller's
/// arguments do not already request them, so every attempt actually produces
/// the structured report the parser consumes, in the directory it scans.
pub fn ensure_reporting_args(args: &mut Vec<String>, results_dir: &Path) {
    let scan = ArgScan::scan(args);
    if scan.results_directory.is_none() {
        args.insert(0, "--results-directory".to_string());
        args.insert(1, results_dir.display().to_string());
    }
    if !scan.trx_logger {
        args.insert(0, "--logger".to_string());
        args.insert(1, "trx".to_string());
    }
}

/// Invokes the `dotnet` host as a child process in the current directory.
pub struct DotnetInvoker {
    program: PathBuf,
}

impl DotnetInvoker {
    /// Creates an invoker for the given host executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TestInvoker for DotnetInvoker {
    async fn invoke(
        &self,
        args: &[String],
        failing: &BTreeSet<String>,
        observer: Option<OutputCallback>,
        cancel: &CancellationToken,
    ) -> Result<RunInvocation, InvokeError> {
        let assembled = build_test_args(args, failing);
        debug!(
            "running: {} {}",
            self.program.display(),
            shell_words::join(assembled.iter().map(String::as_str))
        );

        let mut child = Command::new(&self.program)
            .args(&assembled)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InvokeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();

        let stdout_stream = LinesStream::new(BufReader::new(stdout).lines()).map(
            |line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()),
        );
        let stderr_stream = LinesStream::new(BufReader::new(stderr).lines()).map(
            |line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()),
        );

        let mut merged = stream::select(stdout_stream, stderr_stream);

        let mut stdout_text = String::new();
        let mut stderr_text = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    child.kill().await.ok();
                    return Err(InvokeError::Cancelled);
                }
                line = merged.next() => {
                    let Some(line) = line else { break };
                    if let Some(observer) = &observer {
                        observer(&line);
                    }
                    match &line {
                        OutputLine::Stdout(s) => {
                            stdout_text.push_str(s);
                            stdout_text.push('\n');
                        }
                        OutputLine::Stderr(s) => {
                            stderr_text.push_str(s);
                            stderr_text.push('\n');
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                return Err(InvokeError::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(RunInvocation {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}
