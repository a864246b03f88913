use std::io;

use landlock::RulesetCreated;
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::Signal;
use nix::unistd::getpid;
use sandbox::ResourceLimits;

use crate::seccomp::WorkerFilter;

/// Headroom on top of the output limit for the result file.
pub(crate) const RESULT_SLACK_BYTES: u64 = 64 * 1024;
const MAX_OPEN_FILES: u64 = 64;

/// Kernel-enforced confinement applied to a worker between fork and exec:
/// rlimits, optional namespaces, the Landlock ruleset and the seccomp filter.
///
/// This is the isolation boundary. It holds whatever the submitted code does
/// to the interpreter, and it holds if the service itself is stalled or gone.
pub(crate) struct KernelLimits {
    pub address_space: u64,
    pub cpu_seconds: u64,
    pub file_size: u64,
    pub network_namespace: bool,
    ruleset: Option<RulesetCreated>,
    filter: WorkerFilter,
}

impl KernelLimits {
    pub fn new(limits: &ResourceLimits, network_namespace: bool, ruleset: RulesetCreated) -> Self {
        let time = limits.time_limit;
        let cpu_seconds = time.as_secs() + u64::from(time.subsec_nanos() > 0);
        Self {
            address_space: limits.memory_bytes,
            cpu_seconds: cpu_seconds.max(1),
            file_size: limits.output_bytes.saturating_add(RESULT_SLACK_BYTES),
            network_namespace,
            ruleset: Some(ruleset),
            filter: WorkerFilter::new(),
        }
    }

    /// Apply to the calling process. Runs in the forked child, so only
    /// async-signal-safe calls are made and nothing allocates.
    pub fn apply(&mut self) -> io::Result<()> {
        prctl::set_pdeathsig(Signal::SIGKILL)?;
        setrlimit(Resource::RLIMIT_AS, self.address_space, self.address_space)?;
        // Soft limit raises SIGXCPU; the hard limit one second later is SIGKILL.
        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if self.network_namespace {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
        }
        if let Some(ruleset) = self.ruleset.take() {
            ruleset
                .restrict_self()
                .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))?;
        }
        // Last: the filter refuses unshare, and fork is refused here rather
        // than through RLIMIT_NPROC so threads keep working.
        self.filter.install(getpid())
    }
}
