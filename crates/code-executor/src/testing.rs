//! In-process stand-ins for the worker backend so pool, executor and HTTP
//! behavior can be tested without an interpreter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    CapturedOutput, ErrorKind, Outcome, Sandbox, SandboxConfig, SandboxError,
    SandboxFactory, Submission,
};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{Bounds, LimitPolicy};
use crate::types::ExecutionRequest;

pub fn policy() -> LimitPolicy {
    LimitPolicy {
        time: Bounds {
            default: Duration::from_secs(5),
            max: Duration::from_secs(30),
        },
        memory: Bounds {
            default: 100 << 20,
            max: 1 << 30,
        },
        output: Bounds {
            default: 1 << 20,
            max: 16 << 20,
        },
    }
}

pub fn request(code: &str) -> ExecutionRequest {
    ExecutionRequest {
        id: uuid::Uuid::new_v4(),
        submission: Submission {
            code: code.to_string(),
            bindings: Map::new(),
        },
        limits: policy().defaults(),
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    slots: Mutex<Vec<usize>>,
}

/// Workers that "run" by sleeping and then answering from a small script:
/// `raise` gives a runtime error, `boom` an infrastructure failure, anything
/// else succeeds with the code text as the value.
pub struct FakeFactory {
    delay: Duration,
    fail_create: bool,
    counters: Arc<Counters>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_create: false,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn slots(&self) -> Vec<usize> {
        self.counters.slots.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    async fn startup(&mut self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if self.fail_create {
            return Err(SandboxError::CreationFailed("fake refuses".into()));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.counters.slots.lock().unwrap().push(config.slot);
        Ok(Box::new(FakeSandbox {
            id: config.id.to_string(),
            delay: self.delay,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn destroy(&self, _sandbox: Box<dyn Sandbox>) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&mut self) {}
}

struct FakeSandbox {
    id: String,
    delay: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &mut self,
        submission: &Submission,
        cancel: CancellationToken,
    ) -> sandbox::Result<Outcome> {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        let finished = tokio::select! {
            () = tokio::time::sleep(self.delay) => true,
            () = cancel.cancelled() => false,
        };
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        if !finished {
            return Ok(Outcome::killed("request cancelled"));
        }
        let empty = CapturedOutput::default();
        match submission.code.as_str() {
            "boom" => Err(SandboxError::SpawnFailed("fake spawn failure".into())),
            "raise" => Ok(Outcome::RuntimeError {
                kind: ErrorKind::RuntimeError,
                message: "bad".into(),
                traceback: None,
                stdout: empty.clone(),
                stderr: empty,
            }),
            code => Ok(Outcome::Success {
                value: Value::String(code.to_string()),
                stdout: CapturedOutput {
                    bytes: b"hi\n".to_vec(),
                    truncated: false,
                },
                stderr: empty,
            }),
        }
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        Ok(())
    }
}
