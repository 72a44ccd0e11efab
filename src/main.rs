//! retest CLI - runs `dotnet test`, retrying failed tests until they pass.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use retest::config;
use retest::invoker::{ArgScan, DotnetInvoker, OutputCallback, ensure_reporting_args};
use retest::muxer;
use retest::report::{ConsoleReporter, GitHubSummaryReporter, MultiReporter, Reporter};
use retest::retry::{RetryOptions, RetrySession, SessionOutcome};
use retest::summary::{self, SessionRecord};

#[derive(Parser)]
#[command(name = "retest")]
#[command(about = "Runs dotnet test, retrying failed tests until they pass", long_about = None)]
#[command(version)]
struct Cli {
    /// Maximum retries when re-running failed tests
    #[arg(long)]
    retries: Option<u32>,

    /// Maximum attempts to run tests (retries + 1)
    #[arg(long, hide = true, conflicts_with = "retries")]
    attempts: Option<u32>,

    /// Directory the runner writes TRX reports into
    #[arg(long)]
    results_directory: Option<PathBuf>,

    /// Skip the end-of-session summary
    #[arg(long)]
    no_summary: bool,

    /// Write a machine-readable session record to this path
    #[arg(long)]
    json_summary: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Arguments passed through to dotnet test, after --
    #[arg(last = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging on stderr; stdout belongs to progress and summaries.
    let default_filter = if cli.verbose { "retest=debug" } else { "retest=warn" };
    let filter = EnvFilter::try_from_env("RETEST_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::load_optional_config(&cli.config)?;

    let max_attempts = match (cli.attempts, cli.retries) {
        (Some(attempts), _) => attempts.max(1),
        (None, Some(retries)) => retries + 1,
        (None, None) => config.attempts(),
    };

    let mut args = cli.args.clone();
    let scan = ArgScan::scan(&args);

    // The runner rejects multiple loggers outside Windows, so a caller
    // supplied logger must itself be trx or we could not add ours.
    if scan.has_logger && !scan.trx_logger && !cfg!(windows) {
        bail!("If a logger is specified, it can only be trx on non-Windows platforms.");
    }

    let results_dir = match &scan.results_directory {
        Some(dir) => PathBuf::from(dir),
        None => match cli.results_directory.clone().or_else(|| config.report.results_dir.clone()) {
            Some(dir) => dir,
            None => temp_results_dir()?,
        },
    };

    ensure_reporting_args(&mut args, &results_dir);

    let Some(host) = muxer::locate() else {
        bail!("Could not locate the dotnet host. Is the .NET SDK installed?");
    };

    let ci = std::env::var("CI").is_ok_and(|value| value == "true");
    let no_summary = cli.no_summary || config.report.no_summary;

    let console = Arc::new(ConsoleReporter::new(ci));
    let mut multi = MultiReporter::new().with_reporter(console.clone());
    if config.report.github_summary && !no_summary {
        if let Some(github) = GitHubSummaryReporter::from_env() {
            multi = multi.with_reporter(github);
        }
    }
    let reporter = Arc::new(multi);

    // Operator interrupt kills the in-flight attempt and ends the session.
    let cancel = CancellationToken::new();
    let interrupted = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted.cancel();
        }
    });

    let observer: OutputCallback = {
        let console = console.clone();
        Arc::new(move |line| console.observe_line(line))
    };

    let invoker = Arc::new(DotnetInvoker::new(host));
    let mut session = RetrySession::new(
        invoker,
        reporter.clone(),
        args,
        RetryOptions {
            max_attempts,
            results_dir: results_dir.clone(),
        },
    )
    .with_observer(observer)
    .with_cancellation_token(cancel);

    let outcome = session.run().await?;

    let tally = if no_summary || matches!(outcome, SessionOutcome::FatalFailure { .. }) {
        None
    } else {
        match summary::tally_results(&results_dir) {
            Ok(tally) => Some(tally),
            Err(err) => {
                warn!("failed to tally results: {err}");
                None
            }
        }
    };

    reporter.on_session_complete(&outcome, tally.as_ref()).await;

    if let Some(path) = &cli.json_summary {
        let record = SessionRecord::new(outcome.clone(), session.failing(), tally);
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session record to {}", path.display()))?;
    }

    std::process::exit(outcome.exit_code());
}

/// Creates a fresh per-session results directory under the system temp dir.
///
/// The directory is kept after exit: the reports in it are the session's
/// artifacts, and the runner may still be writing them when we would
/// otherwise clean up.
fn temp_results_dir() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("retest-")
        .tempdir()
        .context("Failed to create results directory")?;
    Ok(dir.keep())
}
