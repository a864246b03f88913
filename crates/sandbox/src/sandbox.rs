use std::any::Any;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{Outcome, Submission};

/// One isolated execution context. Runs exactly one submission.
///
/// The `Any` bound allows `SandboxFactory::destroy()` to downcast
/// `Box<dyn Sandbox>` back to the concrete type for backend-specific cleanup.
#[async_trait]
pub trait Sandbox: Send + Sync + Any {
    fn id(&self) -> &str;

    /// Execute `submission` to a terminal outcome.
    ///
    /// Code-caused failures (syntax errors, exceptions, limit breaches,
    /// cancellation) are reported as an `Outcome`. `Err` is reserved for
    /// failures of the isolation machinery itself.
    async fn run(&mut self, submission: &Submission, cancel: CancellationToken)
    -> Result<Outcome>;

    /// Forcibly terminate the worker if it is still running.
    async fn kill(&mut self) -> Result<()>;
}
