use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every worker a [`ProcessFactory`](crate::ProcessFactory) creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Interpreter to run. A bare name is resolved on `PATH` at factory creation.
    pub python: PathBuf,
    /// Parent of every worker directory. Created on startup.
    pub base_dir: PathBuf,
    /// Top-level modules the harness refuses to import.
    pub blocked_modules: Vec<String>,
    /// Move each worker into fresh user + network namespaces.
    pub network_namespace: bool,
    /// Governor sampling period.
    pub sampling_interval: Duration,
}
