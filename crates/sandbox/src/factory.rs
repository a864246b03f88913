use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Verify host prerequisites and prepare shared directories.
    /// Must be called before `create()` or `destroy()`.
    async fn startup(&mut self) -> Result<()>;
    /// Provision a brand-new worker. Workers are never reused.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Tear down a worker: kill anything still running and reclaim its
    /// scratch space. Never fails; problems are logged.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>);
    /// Release all factory-level resources.
    /// Requires exclusive ownership, so callers sharing via `Arc` must
    /// recover it (e.g. `Arc::try_unwrap`) once every user has dropped.
    async fn shutdown(&mut self);
}
