use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    CapturedOutput, LimitKind, Outcome, Sandbox, SandboxConfig, SandboxError, Submission,
};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::access::{ReadRoots, worker_ruleset};
use crate::capture::{OutputMeter, Stream, capture};
use crate::config::ProcessConfig;
use crate::governor::{Breach, Governor, Termination};
use crate::harness::{Job, ReportFile, read_report};
use crate::limits::KernelLimits;
use crate::paths::WorkerPaths;
use crate::process::{kill_process_group, unreported_exit};
use crate::seccomp::{SockFilter, exec_lock};

/// How long to wait for the pipes to drain once the worker is gone.
const CAPTURE_GRACE: Duration = Duration::from_secs(1);
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl SandboxState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 2, "invalid SandboxState: {v}");
        match v {
            0 => Self::Created,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A single-use Python worker process with its own scratch directory.
pub struct ProcessSandbox {
    config: SandboxConfig,
    factory_config: ProcessConfig,
    read_roots: Arc<ReadRoots>,
    /// Cached `config.id.to_string()`.
    pub(crate) id: String,
    /// Worker paths (used by factory to delete the directory on destroy).
    pub(crate) paths: WorkerPaths,
    process: Option<Child>,
    state: AtomicU8,
}

impl ProcessSandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        factory_config: ProcessConfig,
        read_roots: Arc<ReadRoots>,
        paths: WorkerPaths,
    ) -> Self {
        let id = config.id.to_string();
        Self {
            config,
            factory_config,
            read_roots,
            id,
            paths,
            process: None,
            state: AtomicU8::new(SandboxState::Created as u8),
        }
    }

    fn current_state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn write_job(&self, submission: &Submission) -> sandbox::Result<()> {
        let scratch = self.paths.scratch();
        let result = self.paths.result();
        let lock: Vec<[u32; 4]> = exec_lock().iter().map(SockFilter::words).collect();
        let job = Job {
            code: &submission.code,
            bindings: &submission.bindings,
            scratch_dir: &scratch,
            worker_dir: self.paths.dir(),
            base_dir: &self.factory_config.base_dir,
            blocked_modules: &self.factory_config.blocked_modules,
            result_path: &result,
            output_limit: self.config.limits.output_bytes,
            exec_lock: &lock,
        };
        let body = serde_json::to_vec(&job)
            .map_err(|e| SandboxError::Protocol(format!("encode job: {e}")))?;
        tokio::fs::write(self.paths.job(), body)
            .await
            .map_err(|e| SandboxError::SpawnFailed(format!("write job file: {e}")))
    }

    fn spawn(&self) -> sandbox::Result<Child> {
        let ruleset = worker_ruleset(&self.read_roots, &self.paths)
            .map_err(|e| SandboxError::SpawnFailed(format!("landlock ruleset: {e}")))?;
        let mut kernel = KernelLimits::new(
            &self.config.limits,
            self.factory_config.network_namespace,
            ruleset,
        );
        let scratch = self.paths.scratch();
        let mut cmd = Command::new(&self.factory_config.python);
        cmd.args(["-I", "-B", "-u"])
            .arg(self.paths.harness())
            .arg(self.paths.job())
            .current_dir(&scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &scratch)
            .env("TMPDIR", &scratch)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: the hook runs between fork and exec. It only issues
        // async-signal-safe syscalls (prctl, setrlimit, unshare, landlock,
        // seccomp) on state built before the fork, and does not allocate.
        unsafe {
            cmd.pre_exec(move || kernel.apply());
        }
        cmd.spawn().map_err(|e| {
            SandboxError::SpawnFailed(format!(
                "spawn {}: {e}",
                self.factory_config.python.display()
            ))
        })
    }

    async fn classify(
        &self,
        termination: Termination,
        meter: &OutputMeter,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    ) -> sandbox::Result<Outcome> {
        let status = match termination {
            Termination::Breached(Breach::Time) => return Ok(Outcome::TimedOut { stdout, stderr }),
            Termination::Breached(Breach::Memory) => {
                return Ok(Outcome::ResourceExceeded {
                    limit: LimitKind::Memory,
                    stdout,
                    stderr,
                });
            }
            Termination::Breached(Breach::Output) => {
                return Ok(Outcome::ResourceExceeded {
                    limit: LimitKind::Output,
                    stdout,
                    stderr,
                });
            }
            Termination::Cancelled => {
                return Ok(Outcome::Killed {
                    reason: "request cancelled".to_string(),
                    stdout,
                    stderr,
                });
            }
            Termination::Exited(status) => status,
        };

        // Overflow that raced with a normal exit still counts.
        if meter.exceeded() {
            return Ok(Outcome::ResourceExceeded {
                limit: LimitKind::Output,
                stdout,
                stderr,
            });
        }
        if !status.success() {
            return Ok(unreported_exit(status, None, stdout, stderr));
        }
        match read_report(&self.paths.result(), self.config.limits.output_bytes).await? {
            ReportFile::Found(report) => Ok(report.into_outcome(stdout, stderr)),
            ReportFile::Missing => Ok(unreported_exit(status, None, stdout, stderr)),
            ReportFile::Malformed(detail) => {
                warn!(id = %self.id, detail = %detail, "worker left a malformed result");
                Ok(unreported_exit(status, Some(&detail), stdout, stderr))
            }
        }
    }
}

/// Wait for a capture task, giving up after [`CAPTURE_GRACE`]. A grandchild
/// holding the pipe open must not stall the request.
async fn join_capture(task: JoinHandle<CapturedOutput>, stream: Stream) -> CapturedOutput {
    let abort = task.abort_handle();
    match tokio::time::timeout(CAPTURE_GRACE, task).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            warn!(?stream, error = %e, "capture task failed");
            CapturedOutput::default()
        }
        Err(_) => {
            abort.abort();
            warn!(?stream, "capture did not finish after worker exit");
            CapturedOutput {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &mut self,
        submission: &Submission,
        cancel: CancellationToken,
    ) -> sandbox::Result<Outcome> {
        if !self.transition(SandboxState::Created, SandboxState::Running) {
            return Err(SandboxError::SpawnFailed(format!(
                "worker is {}, workers run exactly once",
                self.current_state()
            )));
        }

        if let Err(e) = self.write_job(submission).await {
            self.state.store(SandboxState::Stopped as u8, Ordering::Release);
            return Err(e);
        }
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.store(SandboxState::Stopped as u8, Ordering::Release);
                return Err(e);
            }
        };
        debug!(id = %self.id, pid = ?child.id(), "worker spawned");

        let meter = Arc::new(OutputMeter::new(self.config.limits.output_bytes));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture(out, Stream::Stdout, Arc::clone(&meter))));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture(err, Stream::Stderr, Arc::clone(&meter))));

        let process = self.process.insert(child);
        let termination = Governor::new(self.factory_config.sampling_interval)
            .attach(process, self.config.limits, Arc::clone(&meter), cancel)
            .enforce()
            .await;
        self.state.store(SandboxState::Stopped as u8, Ordering::Release);

        let stdout = match stdout_task {
            Some(task) => join_capture(task, Stream::Stdout).await,
            None => CapturedOutput::default(),
        };
        let stderr = match stderr_task {
            Some(task) => join_capture(task, Stream::Stderr).await,
            None => CapturedOutput::default(),
        };

        let termination = termination?;
        debug!(id = %self.id, ?termination, "worker finished");
        self.classify(termination, &meter, stdout, stderr).await
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        self.state.store(SandboxState::Stopped as u8, Ordering::Release);
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        if let Some(pid) = process.id() {
            kill_process_group(pid);
        }
        let _ = process.start_kill();
        process.wait().await?;
        Ok(())
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        // The direct child is covered by kill_on_drop; this reaches anything
        // it left behind in its group.
        if let Some(pid) = self.process.as_ref().and_then(Child::id) {
            kill_process_group(pid);
        }
    }
}
