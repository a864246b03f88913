use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sandbox::{CapturedOutput, Outcome};

/// Kill the process group led by `pid` via `killpg(SIGKILL)`.
///
/// Requires the worker to have been spawned with `process_group(0)` so that
/// its PGID equals its PID. No-op if the group is already gone or the PID
/// cannot be represented as `i32`.
pub(crate) fn kill_process_group(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Classify a worker that exited without leaving a usable report.
///
/// `SIGXCPU` means the CPU-seconds rlimit fired, which is the kernel's
/// version of a time limit.
pub(crate) fn unreported_exit(
    status: ExitStatus,
    detail: Option<&str>,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
) -> Outcome {
    if let Some(signal) = status.signal() {
        if signal == Signal::SIGXCPU as i32 {
            return Outcome::TimedOut { stdout, stderr };
        }
        let name = Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| signal.to_string());
        return Outcome::Killed {
            reason: format!("worker terminated by {name}"),
            stdout,
            stderr,
        };
    }
    let code = status.code().unwrap_or(-1);
    let reason = match detail {
        Some(detail) => format!("worker exited with code {code}: {detail}"),
        None => format!("worker exited with code {code} before reporting a result"),
    };
    Outcome::Killed {
        reason,
        stdout,
        stderr,
    }
}
