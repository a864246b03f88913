use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{info, warn};

use crate::access::{ReadRoots, landlock_supported};
use crate::config::ProcessConfig;
use crate::harness::HARNESS_SOURCE;
use crate::paths::{FactoryPaths, WorkerPaths, is_worker_dir};
use crate::sandbox::ProcessSandbox;

/// Creates one fresh Python worker process per execution.
pub struct ProcessFactory {
    config: ProcessConfig,
    factory_paths: FactoryPaths,
    read_roots: Arc<ReadRoots>,
    started: bool,
}

impl ProcessFactory {
    /// Check prerequisites and resolve the interpreter. Call `startup()`
    /// before creating workers.
    pub async fn new(mut config: ProcessConfig) -> Result<Self, SandboxError> {
        let interpreter = crate::prerequisites::check_prerequisites(&config).await?;
        let read_roots = Arc::new(interpreter.read_roots());
        config.python = interpreter.executable;
        let factory_paths = FactoryPaths::new(config.base_dir.clone());
        Ok(Self {
            config,
            factory_paths,
            read_roots,
            started: false,
        })
    }

    /// Remove worker directories left behind by a previous crash.
    async fn remove_stale_workers(&self) {
        let mut entries = match tokio::fs::read_dir(self.factory_paths.base_dir()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list base dir");
                return;
            }
        };
        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_str().is_some_and(is_worker_dir) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "failed to remove stale worker dir"
                ),
            }
        }
        if removed > 0 {
            info!(removed, "removed stale worker dirs");
        }
    }

    async fn prepare_worker(&self, paths: &WorkerPaths) -> sandbox::Result<()> {
        tokio::fs::create_dir_all(paths.scratch())
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("mkdir scratch: {e}")))?;
        tokio::fs::set_permissions(paths.dir(), std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("chmod worker dir: {e}")))?;
        tokio::fs::write(paths.harness(), HARNESS_SOURCE)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("write harness: {e}")))?;
        // Landlock rules attach to existing files, so the result file the
        // worker may write has to exist before it starts.
        tokio::fs::write(paths.result(), b"")
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("create result file: {e}")))
    }
}

#[async_trait]
impl SandboxFactory for ProcessFactory {
    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.started {
            return Err(SandboxError::CreationFailed(
                "factory already started".into(),
            ));
        }
        tokio::fs::create_dir_all(self.factory_paths.base_dir())
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("mkdir base dir: {e}")))?;
        self.remove_stale_workers().await;
        self.started = true;

        let landlock = landlock_supported();
        if !landlock {
            warn!("kernel does not enforce landlock, filesystem confinement is audit-hook only");
        }
        info!(
            landlock,
            python = %self.config.python.display(),
            base_dir = %self.config.base_dir.display(),
            network_namespace = self.config.network_namespace,
            "factory started"
        );
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if !self.started {
            return Err(SandboxError::CreationFailed("factory not started".into()));
        }
        let id = config.id.to_string();
        let paths = WorkerPaths::new(self.factory_paths.worker(&id));

        if paths.dir().exists()
            && let Err(e) = tokio::fs::remove_dir_all(paths.dir()).await
        {
            warn!(id = %id, error = %e, "failed to clean stale worker dir");
        }

        if let Err(e) = self.prepare_worker(&paths).await {
            // Roll back the partially created directory before propagating.
            if let Err(rm_err) = tokio::fs::remove_dir_all(paths.dir()).await {
                warn!(id = %id, error = %rm_err, "failed to remove worker dir during rollback");
            }
            return Err(e);
        }

        info!(id = %id, slot = config.slot, "worker created");
        Ok(Box::new(ProcessSandbox::new(
            config,
            self.config.clone(),
            Arc::clone(&self.read_roots),
            paths,
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<ProcessSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                warn!("destroy called with non-process sandbox, ignoring");
                return;
            }
        };

        if let Err(e) = sandbox.kill().await {
            warn!(id = %sandbox.id, error = %e, "failed to reap worker");
        }

        if let Err(e) = tokio::fs::remove_dir_all(sandbox.paths.dir()).await {
            warn!(id = %sandbox.id, error = %e, "failed to delete worker dir");
        }

        info!(id = %sandbox.id, "worker destroyed");
    }

    async fn shutdown(&mut self) {
        if self.started {
            self.remove_stale_workers().await;
            self.started = false;
        }
        info!("factory shutdown complete");
    }
}
