use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use sandbox::ResourceLimits;
use tokio::process::Child;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capture::{OutputMeter, Stream};
use crate::process::kill_process_group;

/// A limit the governor enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Time,
    Memory,
    Output,
}

/// One observation of a running worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub elapsed: Duration,
    pub rss_bytes: Option<u64>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

impl Sample {
    /// First limit this sample breaches. Time wins over memory, memory
    /// over output.
    pub fn breach(&self, limits: &ResourceLimits) -> Option<Breach> {
        if self.elapsed >= limits.time_limit {
            Some(Breach::Time)
        } else if self.rss_bytes.is_some_and(|rss| rss > limits.memory_bytes) {
            Some(Breach::Memory)
        } else if self.stdout_bytes > limits.output_bytes || self.stderr_bytes > limits.output_bytes
        {
            Some(Breach::Output)
        } else {
            None
        }
    }
}

/// How a governed worker ended.
#[derive(Debug)]
pub enum Termination {
    /// The worker exited on its own (or was stopped by a kernel rlimit).
    Exited(ExitStatus),
    /// The governor killed it for a breach.
    Breached(Breach),
    /// The request was cancelled and the worker killed.
    Cancelled,
}

/// Watches running workers and kills them when they breach a limit.
#[derive(Debug, Clone, Copy)]
pub struct Governor {
    interval: Duration,
}

impl Governor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start governing `child`. The time limit counts from this call.
    pub fn attach<'a>(
        &self,
        child: &'a mut Child,
        limits: ResourceLimits,
        meter: Arc<OutputMeter>,
        cancel: CancellationToken,
    ) -> GovernorHandle<'a> {
        GovernorHandle {
            pid: child.id(),
            child,
            limits,
            meter,
            cancel,
            interval: self.interval,
            started: Instant::now(),
        }
    }
}

/// A governor bound to one worker.
pub struct GovernorHandle<'a> {
    child: &'a mut Child,
    pid: Option<u32>,
    limits: ResourceLimits,
    meter: Arc<OutputMeter>,
    cancel: CancellationToken,
    interval: Duration,
    started: Instant,
}

impl GovernorHandle<'_> {
    /// Run until the worker exits, breaches a limit, or the request is
    /// cancelled. Any path that kills the worker also reaps it.
    pub async fn enforce(mut self) -> io::Result<Termination> {
        let deadline = self.started + self.limits.time_limit;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let breach = tokio::select! {
                biased;
                status = self.child.wait() => return Ok(Termination::Exited(status?)),
                () = self.cancel.cancelled() => {
                    debug!(pid = ?self.pid, "cancelled, killing worker");
                    self.terminate().await?;
                    return Ok(Termination::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => Some(Breach::Time),
                () = self.meter.overflowed() => self.sample().await.breach(&self.limits),
                _ = ticker.tick() => self.sample().await.breach(&self.limits),
            };
            if let Some(breach) = breach {
                debug!(pid = ?self.pid, ?breach, "limit breached, killing worker");
                self.terminate().await?;
                return Ok(Termination::Breached(breach));
            }
        }
    }

    async fn sample(&self) -> Sample {
        let rss_bytes = match self.pid {
            Some(pid) => resident_bytes(&format!("/proc/{pid}/status")).await,
            None => None,
        };
        Sample {
            elapsed: self.started.elapsed(),
            rss_bytes,
            stdout_bytes: self.meter.written(Stream::Stdout),
            stderr_bytes: self.meter.written(Stream::Stderr),
        }
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        // Covers a worker that left its group; errors mean it already exited.
        let _ = self.child.start_kill();
        self.child.wait().await?;
        Ok(())
    }
}

/// Resident memory of the service process itself.
pub async fn self_resident_bytes() -> Option<u64> {
    resident_bytes("/proc/self/status").await
}

async fn resident_bytes(status_path: &str) -> Option<u64> {
    let status = tokio::fs::read_to_string(status_path).await.ok()?;
    parse_vm_rss(&status)
}

/// Extract `VmRSS` (reported in kB) from a `/proc/<pid>/status` body.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let rest = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    fn limits(time_ms: u64) -> ResourceLimits {
        ResourceLimits {
            time_limit: Duration::from_millis(time_ms),
            memory_bytes: 1000,
            output_bytes: 100,
        }
    }

    fn sleeper(secs: &str) -> Child {
        Command::new("sleep")
            .arg(secs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn quiet_sample_breaches_nothing() {
        let sample = Sample {
            elapsed: Duration::from_millis(10),
            rss_bytes: Some(500),
            stdout_bytes: 100,
            stderr_bytes: 0,
        };
        assert_eq!(sample.breach(&limits(1000)), None);
    }

    #[test]
    fn breaches_follow_priority() {
        let all = Sample {
            elapsed: Duration::from_secs(2),
            rss_bytes: Some(2000),
            stdout_bytes: 101,
            stderr_bytes: 0,
        };
        assert_eq!(all.breach(&limits(1000)), Some(Breach::Time));

        let memory_and_output = Sample {
            elapsed: Duration::ZERO,
            ..all
        };
        assert_eq!(memory_and_output.breach(&limits(1000)), Some(Breach::Memory));

        let output_only = Sample {
            rss_bytes: None,
            stdout_bytes: 0,
            stderr_bytes: 101,
            ..memory_and_output
        };
        assert_eq!(output_only.breach(&limits(1000)), Some(Breach::Output));
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  30000 kB\nVmRSS:\t   12345 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(12345 * 1024));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }

    #[tokio::test]
    async fn kills_on_deadline() {
        let mut child = sleeper("30");
        let limits = ResourceLimits {
            memory_bytes: u64::MAX,
            ..limits(200)
        };
        let started = std::time::Instant::now();
        let termination = Governor::new(Duration::from_millis(25))
            .attach(&mut child, limits, Arc::new(OutputMeter::new(100)), CancellationToken::new())
            .enforce()
            .await
            .unwrap();
        assert!(matches!(termination, Termination::Breached(Breach::Time)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn kills_on_cancel() {
        let mut child = sleeper("30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let limits = ResourceLimits {
            memory_bytes: u64::MAX,
            ..limits(10_000)
        };
        let termination = Governor::new(Duration::from_millis(25))
            .attach(&mut child, limits, Arc::new(OutputMeter::new(100)), cancel)
            .enforce()
            .await
            .unwrap();
        assert!(matches!(termination, Termination::Cancelled));
    }

    #[tokio::test]
    async fn reports_normal_exit() {
        let mut child = sleeper("0");
        let limits = ResourceLimits {
            memory_bytes: u64::MAX,
            ..limits(10_000)
        };
        let termination = Governor::new(Duration::from_millis(25))
            .attach(&mut child, limits, Arc::new(OutputMeter::new(100)), CancellationToken::new())
            .enforce()
            .await
            .unwrap();
        match termination {
            Termination::Exited(status) => assert!(status.success()),
            other => panic!("unexpected termination: {other:?}"),
        }
    }
}
