use std::time::Duration;

/// Limits attached to a single worker before any code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock budget for the whole execution.
    pub time_limit: Duration,
    /// Ceiling for the worker's address space and resident memory.
    pub memory_bytes: u64,
    /// Per-stream cap for captured stdout and stderr.
    pub output_bytes: u64,
}

pub struct SandboxConfig {
    pub id: uuid::Uuid,
    /// Index of the pool slot the worker occupies.
    pub slot: usize,
    pub limits: ResourceLimits,
}
