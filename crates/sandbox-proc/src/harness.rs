use std::io;
use std::path::Path;

use sandbox::{CapturedOutput, ErrorKind, LimitKind, Outcome, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::limits::RESULT_SLACK_BYTES;

/// Python side of the worker protocol, written into every worker directory.
pub(crate) const HARNESS_SOURCE: &str = include_str!("harness.py");

/// Job description the harness reads on startup.
#[derive(Debug, Serialize)]
pub(crate) struct Job<'a> {
    pub code: &'a str,
    pub bindings: &'a Map<String, Value>,
    pub scratch_dir: &'a Path,
    pub worker_dir: &'a Path,
    pub base_dir: &'a Path,
    pub blocked_modules: &'a [String],
    pub result_path: &'a Path,
    pub output_limit: u64,
    /// Seccomp program refusing exec, as `[code, jt, jf, k]` rows. The
    /// harness installs it once the interpreter is up.
    pub exec_lock: &'a [[u32; 4]],
}

/// Error classes the harness can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) enum ReportedKind {
    SyntaxError,
    PermissionDenied,
    RuntimeError,
    MemoryExceeded,
    OutputExceeded,
}

/// Contents of `result.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum Report {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Error {
        kind: ReportedKind,
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },
}

impl Report {
    pub fn into_outcome(self, stdout: CapturedOutput, stderr: CapturedOutput) -> Outcome {
        let (kind, message, traceback) = match self {
            Self::Ok { value } => {
                return Outcome::Success {
                    value,
                    stdout,
                    stderr,
                };
            }
            Self::Error {
                kind,
                message,
                traceback,
            } => (kind, message, traceback),
        };
        let kind = match kind {
            ReportedKind::SyntaxError => ErrorKind::SyntaxError,
            ReportedKind::PermissionDenied => ErrorKind::PermissionDenied,
            ReportedKind::RuntimeError => ErrorKind::RuntimeError,
            ReportedKind::MemoryExceeded => {
                return Outcome::ResourceExceeded {
                    limit: LimitKind::Memory,
                    stdout,
                    stderr,
                };
            }
            ReportedKind::OutputExceeded => {
                return Outcome::ResourceExceeded {
                    limit: LimitKind::Output,
                    stdout,
                    stderr,
                };
            }
        };
        Outcome::RuntimeError {
            kind,
            message,
            traceback,
            stdout,
            stderr,
        }
    }
}

/// Result of looking for the harness report after the worker exited.
#[derive(Debug, PartialEq)]
pub(crate) enum ReportFile {
    Missing,
    Malformed(String),
    Found(Report),
}

/// Read and parse the report, refusing files larger than the harness
/// could legitimately have written.
pub(crate) async fn read_report(
    path: &Path,
    output_limit: u64,
) -> Result<ReportFile, SandboxError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReportFile::Missing),
        Err(e) => return Err(e.into()),
    };
    if meta.len() == 0 {
        return Ok(ReportFile::Missing);
    }
    if meta.len() > output_limit.saturating_add(RESULT_SLACK_BYTES) {
        return Ok(ReportFile::Malformed(format!(
            "result file is {} bytes",
            meta.len()
        )));
    }
    let raw = tokio::fs::read(path).await?;
    Ok(match serde_json::from_slice(&raw) {
        Ok(report) => ReportFile::Found(report),
        Err(e) => ReportFile::Malformed(format!("unreadable result: {e}")),
    })
}
