use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sandbox::{Outcome, SandboxConfig, SandboxError, SandboxFactory};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::ExecutionRequest;

/// What happens to a request that finds every slot busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Answer `ConcurrencyExceeded` immediately.
    Reject,
    /// Let up to `depth` requests wait at most `max_wait` for a slot.
    Wait { depth: usize, max_wait: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("no free slot index while holding a permit")]
    SlotTable,

    #[error("worker provisioning failed: {0}")]
    Provision(SandboxError),

    #[error("worker failed: {0}")]
    Worker(SandboxError),
}

/// A held slot. The index goes back on the free list before the permit is
/// released, so a new holder always finds one.
pub struct PoolSlot<'a> {
    index: usize,
    free: &'a Mutex<Vec<usize>>,
    _permit: SemaphorePermit<'a>,
}

impl PoolSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.index);
    }
}

/// Counts a waiting request while alive.
struct QueueTicket<'a>(&'a AtomicUsize);

impl<'a> QueueTicket<'a> {
    fn take(waiting: &'a AtomicUsize, depth: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < depth).then_some(n + 1))
            .ok()
            .map(|_| Self(waiting))
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Admission<'a> {
    Slot(PoolSlot<'a>),
    Saturated,
    Cancelled,
}

/// Fixed set of execution slots. Every admitted request gets a brand-new
/// worker which is destroyed as soon as it has produced an outcome.
pub struct ExecutionPool {
    factory: Arc<dyn SandboxFactory>,
    capacity: usize,
    queue: QueuePolicy,
    permits: Semaphore,
    free: Mutex<Vec<usize>>,
    waiting: AtomicUsize,
}

impl ExecutionPool {
    pub fn new(factory: Arc<dyn SandboxFactory>, capacity: usize, queue: QueuePolicy) -> Self {
        Self {
            factory,
            capacity,
            queue,
            permits: Semaphore::new(capacity),
            // Reversed so slot 0 is handed out first.
            free: Mutex::new((0..capacity).rev().collect()),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// Refuse new admissions. Requests already holding a slot finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `request` on a fresh worker and return its outcome.
    ///
    /// Saturation and cancellation while waiting are outcomes, not errors.
    /// `Err` means the worker machinery itself failed.
    pub async fn submit(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<Outcome, PoolError> {
        let slot = match self.admit(cancel).await? {
            Admission::Slot(slot) => slot,
            Admission::Saturated => {
                warn!(request = %request.id, capacity = self.capacity, "pool saturated");
                return Ok(Outcome::concurrency_exceeded());
            }
            Admission::Cancelled => {
                debug!(request = %request.id, "cancelled while queued");
                return Ok(Outcome::killed("request cancelled"));
            }
        };
        debug!(request = %request.id, slot = slot.index(), "slot acquired");

        let config = SandboxConfig {
            id: request.id,
            slot: slot.index(),
            limits: request.limits,
        };
        let mut worker = self
            .factory
            .create(config)
            .await
            .map_err(PoolError::Provision)?;
        let result = worker.run(&request.submission, cancel.clone()).await;
        self.factory.destroy(worker).await;

        debug!(request = %request.id, slot = slot.index(), "slot released");
        drop(slot);
        result.map_err(PoolError::Worker)
    }

    async fn admit(&self, cancel: &CancellationToken) -> Result<Admission<'_>, PoolError> {
        match self.permits.try_acquire() {
            Ok(permit) => return Ok(Admission::Slot(self.assign(permit)?)),
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }
        let QueuePolicy::Wait { depth, max_wait } = self.queue else {
            return Ok(Admission::Saturated);
        };
        let Some(_ticket) = QueueTicket::take(&self.waiting, depth) else {
            return Ok(Admission::Saturated);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(Admission::Cancelled),
            acquired = tokio::time::timeout(max_wait, self.permits.acquire()) => match acquired {
                Ok(Ok(permit)) => Ok(Admission::Slot(self.assign(permit)?)),
                Ok(Err(_)) => Err(PoolError::Closed),
                Err(_) => Ok(Admission::Saturated),
            },
        }
    }

    fn assign<'a>(&'a self, permit: SemaphorePermit<'a>) -> Result<PoolSlot<'a>, PoolError> {
        let index = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(PoolError::SlotTable)?;
        Ok(PoolSlot {
            index,
            free: &self.free,
            _permit: permit,
        })
    }
}
