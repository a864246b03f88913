use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sandbox::CapturedOutput;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::debug;

const CHUNK: usize = 8 * 1024;

/// Which worker stream a capture task reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Byte counters for both streams of one worker.
///
/// Counts everything the worker wrote, including bytes dropped after the
/// limit, and wakes the governor as soon as either stream overflows.
#[derive(Debug)]
pub struct OutputMeter {
    limit: u64,
    stdout: AtomicU64,
    stderr: AtomicU64,
    overflow: Notify,
}

impl OutputMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            stdout: AtomicU64::new(0),
            stderr: AtomicU64::new(0),
            overflow: Notify::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn written(&self, stream: Stream) -> u64 {
        self.counter(stream).load(Ordering::Relaxed)
    }

    /// True once either stream has gone past the limit.
    pub fn exceeded(&self) -> bool {
        self.written(Stream::Stdout) > self.limit || self.written(Stream::Stderr) > self.limit
    }

    /// Resolves after an overflow has been recorded. A notification sent
    /// before anyone waits is kept for the next waiter.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }

    fn record(&self, stream: Stream, n: u64) {
        let total = self.counter(stream).fetch_add(n, Ordering::Relaxed) + n;
        if total > self.limit {
            self.overflow.notify_one();
        }
    }

    fn counter(&self, stream: Stream) -> &AtomicU64 {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

/// Read `reader` to EOF, keeping at most `meter.limit()` bytes.
///
/// Keeps draining after the limit so the worker never blocks on a full
/// pipe; the governor decides when to stop it.
pub async fn capture<R>(mut reader: R, stream: Stream, meter: Arc<OutputMeter>) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let limit = usize::try_from(meter.limit()).unwrap_or(usize::MAX);
    let mut out = CapturedOutput::default();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "capture read failed");
                break;
            }
        };
        let keep = n.min(limit.saturating_sub(out.bytes.len()));
        if let Some(chunk) = buf.get(..keep) {
            out.bytes.extend_from_slice(chunk);
        }
        if keep < n {
            out.truncated = true;
        }
        meter.record(stream, n as u64);
    }
    out
}
