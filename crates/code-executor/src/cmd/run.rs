use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use sandbox::SandboxFactory;
use sandbox_proc::ProcessFactory;

use crate::config::{ConfigError, LimitArgs, SandboxArgs};
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::pool::{ExecutionPool, QueuePolicy};
use crate::types::{Bindings, ExecuteRequest};

#[derive(Args)]
pub struct RunArgs {
    /// Python source file to execute
    file: PathBuf,
    /// Bindings as a JSON object
    #[arg(long)]
    bindings: Option<String>,
    /// Time limit in milliseconds (defaults to DEFAULT_TIME_LIMIT_MS)
    #[arg(long)]
    time_limit_ms: Option<u64>,
    #[command(flatten)]
    limits: LimitArgs,
    #[command(flatten)]
    sandbox: SandboxArgs,
}

/// Execute one file through the same pool and collector as the service and
/// print the envelope. Succeeds only when the status is `ok`.
pub async fn run_once(args: RunArgs) -> ExecutorResult<ExitCode> {
    let policy = args.limits.validate()?;
    let process = args.sandbox.validate()?;

    let code = tokio::fs::read_to_string(&args.file).await.map_err(|e| {
        ConfigError::Invalid(format!("read {}: {e}", args.file.display()))
    })?;
    let bindings = match &args.bindings {
        Some(raw) => Some(
            serde_json::from_str::<Bindings>(raw)
                .map_err(|e| ConfigError::Invalid(format!("--bindings: {e}")))?
                .0,
        ),
        None => None,
    };

    let mut factory = ProcessFactory::new(process).await?;
    factory.startup().await?;
    let factory = Arc::new(factory);

    let pool = ExecutionPool::new(factory.clone(), 1, QueuePolicy::Reject);
    let executor = Arc::new(Executor::new(pool, policy, Arc::new(Metrics::new())));
    let envelope = executor
        .execute(ExecuteRequest {
            code,
            bindings,
            time_limit_ms: args.time_limit_ms,
            memory_limit_bytes: None,
            output_limit_bytes: None,
        })
        .await;
    executor.drain().await;
    drop(executor);

    let rendered = serde_json::to_string_pretty(&envelope)
        .map_err(|e| ExecutorError::Internal(format!("encode envelope: {e}")))?;
    println!("{rendered}");

    let mut factory = Arc::try_unwrap(factory)
        .map_err(|_| ExecutorError::Internal("factory still referenced at shutdown".into()))?;
    factory.shutdown().await;

    Ok(if envelope.status == "ok" {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
