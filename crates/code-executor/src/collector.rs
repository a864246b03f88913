use sandbox::{LimitKind, Outcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kind for requests refused before execution.
pub const INVALID_REQUEST: &str = "InvalidRequest";
/// Error kind for failures of the execution machinery itself.
pub const INTERNAL_ERROR: &str = "InternalError";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Wire shape shared by every `/execute` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: String,
    pub value: Value,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub error: Option<ErrorDescriptor>,
}

impl ResponseEnvelope {
    fn bare(status: &str, kind: &str, message: String) -> Self {
        Self {
            status: status.to_string(),
            value: Value::Null,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            error: Some(ErrorDescriptor {
                kind: kind.to_string(),
                message,
                traceback: None,
            }),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::bare("error", INVALID_REQUEST, message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::bare("internal_error", INTERNAL_ERROR, message.into())
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

fn limit_message(limit: LimitKind) -> &'static str {
    match limit {
        LimitKind::Memory => "execution exceeded its memory limit",
        LimitKind::Output => "output exceeded its size limit",
        LimitKind::Concurrency => "all execution slots are busy",
    }
}

/// Normalize an outcome into the response envelope.
pub fn collect(outcome: Outcome) -> ResponseEnvelope {
    let status = outcome.status().to_string();
    let (value, stdout, stderr, error) = match outcome {
        Outcome::Success {
            value,
            stdout,
            stderr,
        } => (value, stdout, stderr, None),
        Outcome::RuntimeError {
            kind,
            message,
            traceback,
            stdout,
            stderr,
        } => (
            Value::Null,
            stdout,
            stderr,
            Some(ErrorDescriptor {
                kind: kind.as_str().to_string(),
                message,
                traceback,
            }),
        ),
        Outcome::TimedOut { stdout, stderr } => (
            Value::Null,
            stdout,
            stderr,
            Some(ErrorDescriptor {
                kind: "TimedOut".to_string(),
                message: "execution exceeded its time limit".to_string(),
                traceback: None,
            }),
        ),
        Outcome::ResourceExceeded {
            limit,
            stdout,
            stderr,
        } => (
            Value::Null,
            stdout,
            stderr,
            Some(ErrorDescriptor {
                kind: limit.error_kind().to_string(),
                message: limit_message(limit).to_string(),
                traceback: None,
            }),
        ),
        Outcome::Killed {
            reason,
            stdout,
            stderr,
        } => (
            Value::Null,
            stdout,
            stderr,
            Some(ErrorDescriptor {
                kind: "Killed".to_string(),
                message: reason,
                traceback: None,
            }),
        ),
    };
    ResponseEnvelope {
        status,
        value,
        stdout: stdout.to_text(),
        stderr: stderr.to_text(),
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        error,
    }
}

#[cfg(test)]
mod tests {
    use sandbox::{CapturedOutput, ErrorKind};
    use serde_json::json;

    use super::*;

    fn text(s: &str) -> CapturedOutput {
        CapturedOutput {
            bytes: s.as_bytes().to_vec(),
            truncated: false,
        }
    }

    #[test]
    fn success_has_value_and_no_error() {
        let envelope = collect(Outcome::Success {
            value: json!(4),
            stdout: text("hi\n"),
            stderr: text(""),
        });
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "status": "ok",
                "value": 4,
                "stdout": "hi\n",
                "stderr": "",
                "stdout_truncated": false,
                "stderr_truncated": false,
                "error": null,
            })
        );
    }

    #[test]
    fn runtime_error_carries_kind_and_message() {
        let envelope = collect(Outcome::RuntimeError {
            kind: ErrorKind::RuntimeError,
            message: "bad".into(),
            traceback: Some("Traceback ...".into()),
            stdout: text(""),
            stderr: text(""),
        });
        assert_eq!(envelope.status, "error");
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, "RuntimeError");
        assert_eq!(error.message, "bad");
        assert_eq!(error.traceback.as_deref(), Some("Traceback ..."));
    }

    #[test]
    fn permission_denied_is_an_error_status() {
        let envelope = collect(Outcome::RuntimeError {
            kind: ErrorKind::PermissionDenied,
            message: "operation not permitted in sandbox: os.system".into(),
            traceback: None,
            stdout: text(""),
            stderr: text(""),
        });
        assert_eq!(envelope.status, "error");
        assert_eq!(envelope.error_kind(), Some("PermissionDenied"));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert!(wire["error"].get("traceback").is_none());
    }

    #[test]
    fn truncation_flags_survive() {
        let envelope = collect(Outcome::ResourceExceeded {
            limit: LimitKind::Output,
            stdout: CapturedOutput {
                bytes: b"xxxx".to_vec(),
                truncated: true,
            },
            stderr: text("warn"),
        });
        assert_eq!(envelope.status, "resource_exceeded");
        assert_eq!(envelope.error_kind(), Some("OutputExceeded"));
        assert_eq!(envelope.stdout, "xxxx");
        assert!(envelope.stdout_truncated);
        assert!(!envelope.stderr_truncated);
    }

    #[test]
    fn timeouts_and_kills_keep_partial_output() {
        let timeout = collect(Outcome::TimedOut {
            stdout: text("partial"),
            stderr: text(""),
        });
        assert_eq!(timeout.status, "timeout");
        assert_eq!(timeout.stdout, "partial");
        assert_eq!(timeout.error_kind(), Some("TimedOut"));

        let killed = collect(Outcome::killed("request cancelled"));
        assert_eq!(killed.status, "killed");
        assert_eq!(killed.error.unwrap().message, "request cancelled");
    }

    #[test]
    fn concurrency_and_helpers() {
        assert_eq!(
            collect(Outcome::concurrency_exceeded()).error_kind(),
            Some("ConcurrencyExceeded")
        );
        assert_eq!(ResponseEnvelope::invalid_request("x").status, "error");
        assert_eq!(
            ResponseEnvelope::internal_error("x").error_kind(),
            Some(INTERNAL_ERROR)
        );
    }
}
