use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sandbox::Outcome;

const STATUSES: [&str; 6] = [
    "ok",
    "error",
    "timeout",
    "resource_exceeded",
    "killed",
    "internal_error",
];
const LIMIT_KINDS: [&str; 4] = ["time", "memory", "output", "concurrency"];
const REJECT_REASONS: [&str; 1] = ["invalid"];
const DURATION_BUCKETS: [f64; 7] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct HistogramBucket {
    le: f64,
    count: AtomicU64,
}

/// Duration histogram with cumulative buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// A fixed set of label values, one counter each.
#[derive(Debug)]
struct LabeledCounters {
    labels: &'static [&'static str],
    counters: Vec<Counter>,
}

impl LabeledCounters {
    fn new(labels: &'static [&'static str]) -> Self {
        Self {
            labels,
            counters: labels.iter().map(|_| Counter::default()).collect(),
        }
    }

    /// Unknown labels are ignored; metrics never fail a request.
    fn inc(&self, label: &str) {
        if let Some(counter) = self
            .labels
            .iter()
            .position(|l| *l == label)
            .and_then(|i| self.counters.get(i))
        {
            counter.inc();
        }
    }

    #[cfg(test)]
    fn get(&self, label: &str) -> u64 {
        self.labels
            .iter()
            .position(|l| *l == label)
            .and_then(|i| self.counters.get(i))
            .map_or(0, Counter::get)
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.labels
            .iter()
            .copied()
            .zip(self.counters.iter().map(Counter::get))
    }
}

/// Process-wide execution metrics.
#[derive(Debug)]
pub struct Metrics {
    executions: LabeledCounters,
    duration: Histogram,
    limit_hits: LabeledCounters,
    in_progress: Gauge,
    rejected: LabeledCounters,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-progress gauge when dropped.
pub struct InProgress<'a>(&'a Gauge);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            executions: LabeledCounters::new(&STATUSES),
            duration: Histogram::new(&DURATION_BUCKETS),
            limit_hits: LabeledCounters::new(&LIMIT_KINDS),
            in_progress: Gauge::default(),
            rejected: LabeledCounters::new(&REJECT_REASONS),
        }
    }

    /// Record a terminal outcome.
    pub fn record(&self, outcome: &Outcome, duration: Duration) {
        self.executions.inc(outcome.status());
        self.duration.observe(duration);
        if let Some(kind) = outcome.limit_hit() {
            self.limit_hits.inc(kind);
        }
    }

    /// An outcome decided before any worker existed. Counted, but kept out
    /// of the duration histogram.
    pub fn record_unexecuted(&self, outcome: &Outcome) {
        self.executions.inc(outcome.status());
    }

    pub fn record_internal_error(&self, duration: Duration) {
        self.executions.inc("internal_error");
        self.duration.observe(duration);
    }

    pub fn record_rejected(&self, reason: &str) {
        self.rejected.inc(reason);
    }

    pub fn track_in_progress(&self) -> InProgress<'_> {
        self.in_progress.inc();
        InProgress(&self.in_progress)
    }

    #[cfg(test)]
    pub fn executions(&self, status: &str) -> u64 {
        self.executions.get(status)
    }

    #[cfg(test)]
    pub fn limit_hits(&self, kind: &str) -> u64 {
        self.limit_hits.get(kind)
    }

    #[cfg(test)]
    pub fn in_progress(&self) -> u64 {
        self.in_progress.get()
    }

    /// Prometheus text exposition. `resident_bytes` is the service's own
    /// RSS, sampled by the caller at scrape time.
    pub fn render(&self, resident_bytes: Option<u64>) -> String {
        let mut out = String::new();

        out.push_str("# HELP executions_total Executions by terminal status.\n");
        out.push_str("# TYPE executions_total counter\n");
        for (status, n) in self.executions.iter() {
            let _ = writeln!(out, "executions_total{{status=\"{status}\"}} {n}");
        }

        out.push_str("# HELP execution_duration_seconds Time from slot request to outcome.\n");
        out.push_str("# TYPE execution_duration_seconds histogram\n");
        for bucket in &self.duration.buckets {
            let _ = writeln!(
                out,
                "execution_duration_seconds_bucket{{le=\"{}\"}} {}",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            );
        }
        let count = self.duration.count();
        let sum = self.duration.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "execution_duration_seconds_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "execution_duration_seconds_sum {sum}");
        let _ = writeln!(out, "execution_duration_seconds_count {count}");

        out.push_str("# HELP resource_limit_hits_total Executions ended by a resource limit.\n");
        out.push_str("# TYPE resource_limit_hits_total counter\n");
        for (kind, n) in self.limit_hits.iter() {
            let _ = writeln!(out, "resource_limit_hits_total{{kind=\"{kind}\"}} {n}");
        }

        out.push_str("# HELP executions_in_progress Executions currently admitted.\n");
        out.push_str("# TYPE executions_in_progress gauge\n");
        let _ = writeln!(out, "executions_in_progress {}", self.in_progress.get());

        out.push_str("# HELP requests_rejected_total Requests refused before execution.\n");
        out.push_str("# TYPE requests_rejected_total counter\n");
        for (reason, n) in self.rejected.iter() {
            let _ = writeln!(out, "requests_rejected_total{{reason=\"{reason}\"}} {n}");
        }

        if let Some(bytes) = resident_bytes {
            out.push_str("# HELP process_resident_memory_bytes Resident memory of the service.\n");
            out.push_str("# TYPE process_resident_memory_bytes gauge\n");
            let _ = writeln!(out, "process_resident_memory_bytes {bytes}");
        }
        out
    }
}
