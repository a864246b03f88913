use std::sync::Arc;
use std::time::Instant;

use sandbox::Outcome;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::collector::{ResponseEnvelope, collect};
use crate::config::LimitPolicy;
use crate::metrics::Metrics;
use crate::pool::ExecutionPool;
use crate::types::{ExecuteRequest, Rejection};

/// Drives one request through validation, the pool, collection and
/// metrics. Shared by the HTTP surface and the `run` subcommand.
pub struct Executor {
    pool: ExecutionPool,
    policy: LimitPolicy,
    metrics: Arc<Metrics>,
    tasks: TaskTracker,
}

impl Executor {
    pub fn new(pool: ExecutionPool, policy: LimitPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            policy,
            metrics,
            tasks: TaskTracker::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    /// Execute a request to a response envelope.
    ///
    /// The work runs on its own task. Dropping the returned future cancels
    /// the request: the worker is killed and the task still releases the slot.
    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> ResponseEnvelope {
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let this = Arc::clone(self);
        let task = self
            .tasks
            .spawn(async move { this.execute_inner(request, cancel).await });
        match task.await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "execution task failed");
                ResponseEnvelope::internal_error("execution task failed")
            }
        }
    }

    async fn execute_inner(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ResponseEnvelope {
        let request = match request.validate(&self.policy) {
            Ok(request) => request,
            Err(Rejection::Invalid(reason)) => {
                warn!(reason = %reason, "request rejected");
                self.metrics.record_rejected("invalid");
                return ResponseEnvelope::invalid_request(reason);
            }
            Err(Rejection::Syntax(message)) => {
                debug!(message = %message, "code does not parse");
                let outcome = Outcome::syntax_error(message);
                self.metrics.record_unexecuted(&outcome);
                return collect(outcome);
            }
        };
        debug!(
            request = %request.id,
            time_limit_ms = request.limits.time_limit.as_millis() as u64,
            memory_bytes = request.limits.memory_bytes,
            output_bytes = request.limits.output_bytes,
            "request validated"
        );

        let _in_progress = self.metrics.track_in_progress();
        let started = Instant::now();
        match self.pool.submit(&request, &cancel).await {
            Ok(outcome) => {
                let duration = started.elapsed();
                self.metrics.record(&outcome, duration);
                info!(
                    request = %request.id,
                    status = outcome.status(),
                    limit = outcome.limit_hit(),
                    duration_ms = duration.as_millis() as u64,
                    "execution finished"
                );
                collect(outcome)
            }
            Err(e) => {
                let duration = started.elapsed();
                self.metrics.record_internal_error(duration);
                error!(request = %request.id, error = %e, "execution failed");
                ResponseEnvelope::internal_error(e.to_string())
            }
        }
    }

    /// Stop admitting work and wait for in-flight executions to finish.
    pub async fn drain(&self) {
        self.pool.close();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
