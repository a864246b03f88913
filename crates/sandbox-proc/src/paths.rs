use std::path::{Path, PathBuf};

/// Directory name prefix for per-worker directories.
pub const WORKER_PREFIX: &str = "worker-";

/// Factory-level paths derived from the base directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Worker directory: `<base>/worker-<id>/`.
    pub fn worker(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{WORKER_PREFIX}{id}"))
    }
}

/// Check whether a directory name matches the worker naming convention.
pub(crate) fn is_worker_dir(name: &str) -> bool {
    name.starts_with(WORKER_PREFIX)
}

/// Per-worker paths. Everything lives under one directory so teardown is a
/// single recursive delete.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    dir: PathBuf,
}

impl WorkerPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The only location the executed code may write to; also its cwd.
    pub fn scratch(&self) -> PathBuf {
        self.dir.join("scratch")
    }

    pub fn harness(&self) -> PathBuf {
        self.dir.join("harness.py")
    }

    /// Job description, consumed and deleted by the harness.
    pub fn job(&self) -> PathBuf {
        self.dir.join("job.json")
    }

    pub fn result(&self) -> PathBuf {
        self.dir.join("result.json")
    }
}
