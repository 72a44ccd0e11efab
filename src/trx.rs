//! TRX test report parsing.
//!
//! `dotnet test --logger trx` emits one `.trx` file per invocation into the
//! results directory. This module folds every file in that directory into a
//! single map from fully-qualified test name to [`TestOutcome`], which the
//! retry engine uses to decide what to re-run.
//!
//! Two rules shape the merge:
//!
//! - **Newest file wins**: files are processed most-recently-modified first,
//!   and a result record id is only honored the first time it is seen across
//!   the whole parse. A filtered re-run writes a fresh file with the same
//!   test ids, so its outcomes shadow the older file's.
//! - **Sticky failure**: parameterized tests emit several result records that
//!   collapse to one fully-qualified name. Once a name is recorded as failed
//!   within a parse, a later non-failed record cannot clear it.
//!
//! The runner is always invoked with a single flat `--results-directory`, so
//! the scan is intentionally non-recursive.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

/// Outcome of a single test, as recorded in a TRX report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    /// The test ran and passed.
    Passed,
    /// The test ran and failed.
    Failed,
    /// The test was not executed (`NotExecuted` in TRX terms).
    Skipped,
    /// Any other status (inconclusive, timeout, pending...).
    Other,
}

impl TestOutcome {
    /// Maps the literal TRX `outcome` attribute to an outcome.
    ///
    /// Only the exact string `"Failed"` counts as failed; everything else is
    /// non-failing for retry purposes.
    fn from_status(status: Option<&str>) -> Self {
        match status {
            Some("Failed") => TestOutcome::Failed,
            Some("Passed") => TestOutcome::Passed,
            Some("NotExecuted") => TestOutcome::Skipped,
            _ => TestOutcome::Other,
        }
    }

    /// Whether this outcome keeps a test in the failing set.
    pub fn is_failed(self) -> bool {
        self == TestOutcome::Failed
    }
}

/// Errors raised while reading TRX reports.
///
/// A result record without a matching test definition is an invariant
/// violation, not a recoverable condition: the runner always writes both
/// record kinds together, and skipping the record would under-count failing
/// tests and let the retry loop declare success it did not earn.
#[derive(Debug, thiserror::Error)]
pub enum TrxError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed TRX document {path}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },

    #[error("invalid attribute in {path}")]
    Attr {
        path: PathBuf,
        #[source]
        source: quick_xml::events::attributes::AttrError,
    },

    #[error("{element} element in {path} is missing its {attribute} attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
        path: PathBuf,
    },

    #[error("result record {test_id} in {path} has no matching test definition")]
    MissingDefinition { test_id: String, path: PathBuf },
}

/// Everything the rest of the tool needs from a results directory.
#[derive(Debug, Default)]
pub struct TrxReport {
    /// Fully-qualified test name to merged outcome.
    pub outcomes: HashMap<String, TestOutcome>,
    /// Earliest `<Times start>` across all files, if any file carries one.
    pub started: Option<DateTime<FixedOffset>>,
    /// Latest `<Times finish>` across all files.
    pub finished: Option<DateTime<FixedOffset>>,
}

/// Parses every `.trx` file in `dir` into one outcome map.
///
/// A missing directory is not an error: the first attempt may run before the
/// runner has emitted anything, and an empty map is the correct answer.
pub fn parse_outcomes(dir: &Path) -> Result<HashMap<String, TestOutcome>, TrxError> {
    parse_report(dir).map(|report| report.outcomes)
}

/// Parses every `.trx` file in `dir`, also aggregating run timestamps.
pub fn parse_report(dir: &Path) -> Result<TrxReport, TrxError> {
    let mut report = TrxReport::default();
    if !dir.is_dir() {
        return Ok(report);
    }

    // One seen-set for the whole parse, not per file: that is what makes the
    // newest file authoritative for any test id it contains.
    let mut seen_ids: HashSet<String> = HashSet::new();

    for path in trx_files_newest_first(dir)? {
        let doc = parse_file(&path)?;
        debug!(
            file = %path.display(),
            results = doc.results.len(),
            "parsed TRX report"
        );

        for record in doc.results {
            if !seen_ids.insert(record.test_id.clone()) {
                continue;
            }

            let fqn = doc.definitions.get(&record.test_id).cloned().ok_or_else(|| {
                TrxError::MissingDefinition {
                    test_id: record.test_id.clone(),
                    path: path.clone(),
                }
            })?;

            let outcome = TestOutcome::from_status(record.outcome.as_deref());
            match report.outcomes.get(&fqn) {
                Some(existing) if existing.is_failed() => {}
                _ => {
                    report.outcomes.insert(fqn, outcome);
                }
            }
        }

        if let Some(started) = doc.started {
            report.started = Some(match report.started {
                Some(current) => current.min(started),
                None => started,
            });
        }
        if let Some(finished) = doc.finished {
            report.finished = Some(match report.finished {
                Some(current) => current.max(finished),
                None => finished,
            });
        }
    }

    Ok(report)
}

/// Lists `*.trx` files directly under `dir`, most recently modified first.
fn trx_files_newest_first(dir: &Path) -> Result<Vec<PathBuf>, TrxError> {
    let read_dir = fs::read_dir(dir).map_err(|source| TrxError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| TrxError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "trx") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(|source| TrxError::Io {
                path: path.clone(),
                source,
            })?;
        files.push((path, modified));
    }

    files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(files.into_iter().map(|(path, _)| path).collect())
}

/// A `<UnitTestResult>` record, in document order.
struct RawResult {
    test_id: String,
    outcome: Option<String>,
}

/// One parsed TRX document.
struct TrxDocument {
    results: Vec<RawResult>,
    /// `<UnitTest id>` to `className.name` from the nested `<TestMethod>`.
    definitions: HashMap<String, String>,
    started: Option<DateTime<FixedOffset>>,
    finished: Option<DateTime<FixedOffset>>,
}

fn parse_file(path: &Path) -> Result<TrxDocument, TrxError> {
    let text = fs::read_to_string(path).map_err(|source| TrxError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader = Reader::from_str(&text);
    let mut doc = TrxDocument {
        results: Vec::new(),
        definitions: HashMap::new(),
        started: None,
        finished: None,
    };

    // Set while inside a <UnitTest> element, so the nested <TestMethod> can
    // be cross-referenced back to the definition id.
    let mut current_definition: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|source| TrxError::Xml {
            path: path.to_path_buf(),
            source,
        })?;

        match event {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"UnitTestResult" => {
                    let test_id = read_attr(e, b"testId", path)?.ok_or_else(|| {
                        TrxError::MissingAttribute {
                            element: "UnitTestResult",
                            attribute: "testId",
                            path: path.to_path_buf(),
                        }
                    })?;
                    let outcome = read_attr(e, b"outcome", path)?;
                    doc.results.push(RawResult { test_id, outcome });
                }
                b"UnitTest" => {
                    current_definition = read_attr(e, b"id", path)?;
                }
                b"TestMethod" => {
                    if let Some(id) = current_definition.clone() {
                        let class_name =
                            read_attr(e, b"className", path)?.unwrap_or_default();
                        let name = read_attr(e, b"name", path)?.unwrap_or_default();
                        doc.definitions.insert(id, format!("{class_name}.{name}"));
                    }
                }
                b"Times" => {
                    doc.started = read_attr(e, b"start", path)?
                        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok());
                    doc.finished = read_attr(e, b"finish", path)?
                        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok());
                }
                _ => {}
            },
            Event::End(ref e) if e.local_name().as_ref() == b"UnitTest" => {
                current_definition = None;
            }
            _ => {}
        }
    }

    Ok(doc)
}

/// Reads one attribute by local name, unescaping its value.
fn read_attr(
    element: &BytesStart<'_>,
    name: &[u8],
    path: &Path,
) -> Result<Option<String>, TrxError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|source| TrxError::Attr {
            path: path.to_path_buf(),
            source,
        })?;
        if attr.key.local_name().as_ref() == name {
            let value = attr.unescape_value().map_err(|source| TrxError::Xml {
                path: path.to_path_buf(),
                source,
            })?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
