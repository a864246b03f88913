use std::fmt;

use serde_json::{Map, Value};

/// Code plus the names it should see bound when it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub code: String,
    pub bindings: Map<String, Value>,
}

/// A captured output stream. `bytes` is always a prefix of what the
/// worker actually wrote; `truncated` is set once anything was dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Classification of failures raised by the executed code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SyntaxError,
    PermissionDenied,
    RuntimeError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "SyntaxError",
            Self::PermissionDenied => "PermissionDenied",
            Self::RuntimeError => "RuntimeError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits other than wall-clock time that can end an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Memory,
    Output,
    Concurrency,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Output => "output",
            Self::Concurrency => "concurrency",
        }
    }

    /// Name used in the error taxonomy (`MemoryExceeded`, ...).
    pub fn error_kind(self) -> &'static str {
        match self {
            Self::Memory => "MemoryExceeded",
            Self::Output => "OutputExceeded",
            Self::Concurrency => "ConcurrencyExceeded",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one execution attempt. Exactly one per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        value: Value,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
    RuntimeError {
        kind: ErrorKind,
        message: String,
        traceback: Option<String>,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
    TimedOut {
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
    ResourceExceeded {
        limit: LimitKind,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
    Killed {
        reason: String,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
}

impl Outcome {
    /// Backpressure signal for a saturated pool. Nothing ran, so there is
    /// no output.
    pub fn concurrency_exceeded() -> Self {
        Self::ResourceExceeded {
            limit: LimitKind::Concurrency,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }

    /// Code that does not parse. Reported without running anything.
    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::RuntimeError {
            kind: ErrorKind::SyntaxError,
            message: message.into(),
            traceback: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }

    pub fn killed(reason: impl Into<String>) -> Self {
        Self::Killed {
            reason: reason.into(),
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        }
    }

    /// Wire-level status label.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "ok",
            Self::RuntimeError { .. } => "error",
            Self::TimedOut { .. } => "timeout",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::Killed { .. } => "killed",
        }
    }

    /// Which limit ended the run, if any, including wall-clock time.
    pub fn limit_hit(&self) -> Option<&'static str> {
        match self {
            Self::TimedOut { .. } => Some("time"),
            Self::ResourceExceeded { limit, .. } => Some(limit.as_str()),
            _ => None,
        }
    }

    pub fn stdout(&self) -> &CapturedOutput {
        match self {
            Self::Success { stdout, .. }
            | Self::RuntimeError { stdout, .. }
            | Self::TimedOut { stdout, .. }
            | Self::ResourceExceeded { stdout, .. }
            | Self::Killed { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &CapturedOutput {
        match self {
            Self::Success { stderr, .. }
            | Self::RuntimeError { stderr, .. }
            | Self::TimedOut { stderr, .. }
            | Self::ResourceExceeded { stderr, .. }
            | Self::Killed { stderr, .. } => stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_cover_every_variant() {
        let out = CapturedOutput::default();
        let cases = [
            (
                Outcome::Success {
                    value: Value::Null,
                    stdout: out.clone(),
                    stderr: out.clone(),
                },
                "ok",
            ),
            (
                Outcome::RuntimeError {
                    kind: ErrorKind::RuntimeError,
                    message: "bad".into(),
                    traceback: None,
                    stdout: out.clone(),
                    stderr: out.clone(),
                },
                "error",
            ),
            (
                Outcome::TimedOut {
                    stdout: out.clone(),
                    stderr: out.clone(),
                },
                "timeout",
            ),
            (Outcome::syntax_error("invalid syntax"), "error"),
            (Outcome::concurrency_exceeded(), "resource_exceeded"),
            (Outcome::killed("signal 9"), "killed"),
        ];
        for (outcome, status) in cases {
            assert_eq!(outcome.status(), status);
        }
    }

    #[test]
    fn limit_hit_reports_time_for_timeouts() {
        let timed_out = Outcome::TimedOut {
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
        };
        assert_eq!(timed_out.limit_hit(), Some("time"));
        assert_eq!(Outcome::concurrency_exceeded().limit_hit(), Some("concurrency"));
        assert_eq!(Outcome::killed("x").limit_hit(), None);
    }

    #[test]
    fn captured_output_text_is_lossy() {
        let out = CapturedOutput {
            bytes: vec![b'h', b'i', 0xff],
            truncated: true,
        };
        assert_eq!(out.to_text(), "hi\u{fffd}");
    }
}
