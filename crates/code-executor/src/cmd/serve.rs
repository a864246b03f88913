use std::sync::Arc;

use sandbox::SandboxFactory;
use sandbox_proc::ProcessFactory;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{ConfigError, ServeArgs};
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::Executor;
use crate::http::{self, AppState};
use crate::metrics::Metrics;
use crate::pool::ExecutionPool;

/// Validate config, start both listeners, and serve until SIGTERM/SIGINT.
pub async fn run_serve(args: ServeArgs) -> ExecutorResult<()> {
    let config = args.validate()?;

    let mut factory = ProcessFactory::new(config.process.clone()).await?;
    factory.startup().await?;
    let factory = Arc::new(factory);

    let metrics = Arc::new(Metrics::new());
    let pool = ExecutionPool::new(factory.clone(), config.capacity, config.queue);
    let executor = Arc::new(Executor::new(pool, config.limits, Arc::clone(&metrics)));

    let main_listener = bind(config.main_addr).await?;
    let metrics_listener = bind(config.metrics_addr).await?;
    info!(
        main = %config.main_addr,
        metrics = %config.metrics_addr,
        capacity = config.capacity,
        queue = ?config.queue,
        "listening"
    );

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, draining");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, draining");
            }
        }
        let _ = stop_tx.send(true);
    });

    let metrics_server = {
        let mut stop = stop_rx.clone();
        let router = http::metrics_router(Arc::clone(&metrics));
        tokio::spawn(async move {
            axum::serve(metrics_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await
        })
    };

    let mut stop = stop_rx;
    let served = axum::serve(main_listener, http::main_router(AppState::new(executor.clone())))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "main server failed");
    }

    info!(in_use = executor.pool().in_use(), "waiting for running executions to finish");
    executor.drain().await;

    match metrics_server.await {
        Ok(Err(e)) => error!(error = %e, "metrics server failed"),
        Err(e) => error!(error = %e, "metrics server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("shutting down factory");
    drop(executor);
    let mut factory = Arc::try_unwrap(factory)
        .map_err(|_| ExecutorError::Internal("factory still referenced at shutdown".into()))?;
    factory.shutdown().await;

    info!("code executor stopped");
    Ok(())
}

async fn bind(addr: std::net::SocketAddr) -> ExecutorResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ConfigError::Invalid(format!("bind {addr}: {e}")).into())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
