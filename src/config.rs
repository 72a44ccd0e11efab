//! Configuration loading and schema definitions.
//!
//! Defaults live in an optional `retest.toml` next to the project being
//! tested; command-line flags always win over the file. Everything has a
//! default, so running with no file and no flags is fully supported.
//!
//! # Example
//!
//! ```toml
//! [retry]
//! retries = 5
//!
//! [report]
//! results_dir = "artifacts/test-results"
//! no_summary = false
//! github_summary = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "retest.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Retry behavior.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Report and summary settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Retry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial run. The total attempt budget is
    /// `retries + 1`.
    ///
    /// Default: 3
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

/// Report settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory the runner writes TRX reports into.
    ///
    /// When not set (and not passed on the command line), a fresh directory
    /// is created under the system temp dir for each session.
    pub results_dir: Option<PathBuf>,

    /// Skip the end-of-session summary entirely.
    ///
    /// Default: false
    #[serde(default)]
    pub no_summary: bool,

    /// Write a markdown summary to `$GITHUB_STEP_SUMMARY` when that file is
    /// available.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub github_summary: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            results_dir: None,
            no_summary: false,
            github_summary: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Total attempt budget, first run included.
    pub fn attempts(&self) -> u32 {
        self.retry.retries + 1
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a file that may not exist, falling back to
/// defaults when it doesn't.
pub fn load_optional_config(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}
