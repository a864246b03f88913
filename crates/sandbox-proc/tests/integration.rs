//! End-to-end runs against a real interpreter. Every test is skipped when
//! `python3` (3.8+) is not available on the host.

use std::path::Path;
use std::time::{Duration, Instant};

use sandbox::{
    ErrorKind, LimitKind, Outcome, ResourceLimits, SandboxConfig, SandboxFactory, Submission,
};
use sandbox_proc::{ProcessConfig, ProcessFactory};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn limits() -> ResourceLimits {
    ResourceLimits {
        time_limit: Duration::from_secs(5),
        memory_bytes: 256 << 20,
        output_bytes: 1 << 20,
    }
}

async fn factory(base: &Path) -> Option<ProcessFactory> {
    if which::which("python3").is_err() {
        eprintln!("python3 not found, skipping");
        return None;
    }
    let config = ProcessConfig {
        python: "python3".into(),
        base_dir: base.to_path_buf(),
        blocked_modules: vec!["ctypes".into(), "_ctypes".into()],
        network_namespace: false,
        sampling_interval: Duration::from_millis(25),
    };
    match ProcessFactory::new(config).await {
        Ok(mut factory) => {
            factory.startup().await.unwrap();
            Some(factory)
        }
        Err(e) => {
            eprintln!("process backend unavailable, skipping: {e}");
            None
        }
    }
}

async fn run_with(
    factory: &ProcessFactory,
    code: &str,
    bindings: Value,
    limits: ResourceLimits,
    cancel: CancellationToken,
) -> Outcome {
    let config = SandboxConfig {
        id: uuid::Uuid::new_v4(),
        slot: 0,
        limits,
    };
    let mut worker = factory.create(config).await.unwrap();
    let submission = Submission {
        code: code.to_string(),
        bindings: bindings.as_object().cloned().unwrap_or_default(),
    };
    let outcome = worker.run(&submission, cancel).await.unwrap();
    factory.destroy(worker).await;
    outcome
}

async fn run(factory: &ProcessFactory, code: &str) -> Outcome {
    run_with(factory, code, json!({}), limits(), CancellationToken::new()).await
}

fn expect_error(outcome: Outcome, expected: ErrorKind) -> String {
    match outcome {
        Outcome::RuntimeError { kind, message, .. } => {
            assert_eq!(kind, expected, "message: {message}");
            message
        }
        other => panic!("expected {expected} error, got {other:?}"),
    }
}

// =========================================================================
// Group 1: results
// =========================================================================

#[tokio::test]
async fn last_expression_is_the_value() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run(&factory, "print(\"hi\")\n2+2").await;
    match outcome {
        Outcome::Success { value, stdout, stderr } => {
            assert_eq!(value, json!(4));
            assert_eq!(stdout.bytes, b"hi\n");
            assert!(!stdout.truncated);
            assert!(stderr.bytes.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn bindings_are_visible_as_globals() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run_with(
        &factory,
        "{'sum': a + b, 'name': name.upper()}",
        json!({"a": 2, "b": 3, "name": "py"}),
        limits(),
        CancellationToken::new(),
    )
    .await;
    assert_eq!(
        outcome,
        Outcome::Success {
            value: json!({"sum": 5, "name": "PY"}),
            stdout: Default::default(),
            stderr: Default::default(),
        }
    );
}

#[tokio::test]
async fn main_is_called_with_bindings() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run_with(
        &factory,
        "def main(x, y):\n    return x * y\n",
        json!({"x": 6, "y": 7}),
        limits(),
        CancellationToken::new(),
    )
    .await;
    match outcome {
        Outcome::Success { value, .. } => assert_eq!(value, json!(42)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_values_fall_back_to_repr() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    match run(&factory, "range(3)").await {
        Outcome::Success { value, .. } => assert_eq!(value, json!("range(0, 3)")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn statements_only_yield_null() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    match run(&factory, "x = 1").await {
        Outcome::Success { value, .. } => assert_eq!(value, Value::Null),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// =========================================================================
// Group 2: errors
// =========================================================================

#[tokio::test]
async fn exceptions_are_runtime_errors() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    match run(&factory, "raise ValueError(\"bad\")").await {
        Outcome::RuntimeError { kind, message, traceback, .. } => {
            assert_eq!(kind, ErrorKind::RuntimeError);
            assert_eq!(message, "bad");
            let traceback = traceback.unwrap();
            assert!(traceback.contains("ValueError"), "{traceback}");
            assert!(!traceback.contains("harness.py"), "{traceback}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn lone_surrogates_are_escaped() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    match run(&factory, r"['\ud800', {'k\udfff': 1}]").await {
        Outcome::Success { value, .. } => {
            assert_eq!(value, json!(["\\ud800", {"k\\udfff": 1}]));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let message = expect_error(
        run(&factory, r"raise ValueError('bad \ud800')").await,
        ErrorKind::RuntimeError,
    );
    assert_eq!(message, "bad \\ud800");
}

#[tokio::test]
async fn syntax_errors_run_nothing() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run(&factory, "print('side effect')\ndef f(:\n    pass").await;
    assert!(outcome.stdout().bytes.is_empty());
    expect_error(outcome, ErrorKind::SyntaxError);
}

// =========================================================================
// Group 3: isolation
// =========================================================================

#[tokio::test]
async fn process_spawning_is_denied() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run(&factory, "import os\nos.system(\"ls /\")").await;
    let message = expect_error(outcome, ErrorKind::PermissionDenied);
    assert!(message.contains("os.system"), "{message}");
}

#[tokio::test]
async fn sockets_are_denied() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run(&factory, "import socket\nsocket.socket()").await;
    expect_error(outcome, ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn blocked_modules_cannot_be_imported() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let outcome = run(&factory, "import ctypes").await;
    expect_error(outcome, ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn writes_are_confined_to_scratch() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let code = "open('notes.txt', 'w').write('ok')\nopen('notes.txt').read()";
    let inside = run(&factory, code).await;
    match inside {
        Outcome::Success { value, .. } => assert_eq!(value, json!("ok")),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let target = base.path().join("escape.txt");
    let code = format!("open({:?}, 'w').write('x')", target.display().to_string());
    expect_error(run(&factory, &code).await, ErrorKind::PermissionDenied);
    assert!(!target.exists());
}

#[tokio::test]
async fn other_workers_are_invisible() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let code = format!("import os\nos.listdir({:?})", base.path().display().to_string());
    expect_error(run(&factory, &code).await, ErrorKind::PermissionDenied);
}

/// Tries to switch the audit hook off from inside the submission, then
/// attempts everything the hook would have refused.
const TAMPER_THEN_ESCAPE: &str = r#"
import gc, os, socket, sys

def allow_everything(event, args, *rest, **named):
    pass

harness = sys.modules["__main__"]
for name in ("within", "resolve"):
    try:
        setattr(harness, name, lambda *a, **k: True)
    except Exception:
        pass
def hooks():
    for obj in gc.get_objects():
        try:
            if getattr(obj, "__name__", None) == "audit" and hasattr(obj, "__code__"):
                yield obj
        except Exception:
            pass

for hook in list(hooks()):
    for attr, value in (("__code__", allow_everything.__code__), ("__defaults__", None)):
        try:
            setattr(hook, attr, value)
        except Exception:
            pass

def attempt(action):
    try:
        return bool(action())
    except OSError:
        return False

{
    "system": attempt(lambda: os.system("echo > marker") == 0 or os.path.exists("marker")),
    "socket": attempt(lambda: socket.socket().close() or True),
    "kill_parent": attempt(lambda: os.kill(os.getppid(), 0) or True),
    "exec": attempt(lambda: os.execv("/bin/true", ["true"])),
    "outside_write": attempt(lambda: open(OUTSIDE, "w").write("x")),
}
"#;

#[tokio::test]
async fn tampered_policy_cannot_escape() {
    let base = tempfile::tempdir().unwrap();
    let workers = base.path().join("workers");
    let Some(factory) = factory(&workers).await else { return };

    let outside = base.path().join("outside.txt");
    let code = format!(
        "OUTSIDE = {:?}\n{TAMPER_THEN_ESCAPE}",
        outside.display().to_string()
    );
    match run(&factory, &code).await {
        Outcome::Success { value, .. } => assert_eq!(
            value,
            json!({
                "system": false,
                "socket": false,
                "kill_parent": false,
                "exec": false,
                "outside_write": false,
            })
        ),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!outside.exists());
}

#[tokio::test]
async fn sequential_runs_share_nothing() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let first = run(&factory, "secret = 41\nopen('left.txt', 'w').write('x')\nsecret + 1").await;
    assert_eq!(first.status(), "ok");

    match run(&factory, "import os\n['secret' in globals(), os.listdir('.')]").await {
        Outcome::Success { value, .. } => assert_eq!(value, json!([false, []])),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Worker directories are removed on destroy.
    let leftovers: Vec<_> = std::fs::read_dir(base.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

// =========================================================================
// Group 4: limits
// =========================================================================

#[tokio::test]
async fn busy_loop_times_out() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let limits = ResourceLimits {
        time_limit: Duration::from_millis(500),
        ..limits()
    };
    let started = Instant::now();
    let outcome = run_with(
        &factory,
        "while True: pass",
        json!({}),
        limits,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome.status(), "timeout");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn large_allocations_exceed_memory() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let limits = ResourceLimits {
        memory_bytes: 128 << 20,
        ..limits()
    };
    let outcome = run_with(
        &factory,
        "x = bytearray(1 << 30)",
        json!({}),
        limits,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome.limit_hit(), Some(LimitKind::Memory.as_str()));
}

#[tokio::test]
async fn output_is_truncated_to_a_prefix() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let limits = ResourceLimits {
        output_bytes: 1000,
        ..limits()
    };
    let outcome = run_with(
        &factory,
        "print('x' * 5000)",
        json!({}),
        limits,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome.limit_hit(), Some("output"));
    let stdout = outcome.stdout();
    assert_eq!(stdout.bytes.len(), 1000);
    assert!(stdout.bytes.iter().all(|b| *b == b'x'));
    assert!(stdout.truncated);
}

#[tokio::test]
async fn cancellation_kills_the_worker() {
    let base = tempfile::tempdir().unwrap();
    let Some(factory) = factory(base.path()).await else { return };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    match run_with(&factory, "while True: pass", json!({}), limits(), cancel).await {
        Outcome::Killed { reason, .. } => assert_eq!(reason, "request cancelled"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
