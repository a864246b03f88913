use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sandbox::SandboxError;
use tokio::process::Command;

use crate::access::ReadRoots;
use crate::config::ProcessConfig;

/// Oldest interpreter with `sys.addaudithook`.
const MIN_PYTHON: (u32, u32) = (3, 8);
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const INSPECT_SCRIPT: &str = "import sys\n\
print('%d.%d' % sys.version_info[:2])\n\
print(sys.executable)\n\
print(sys.prefix)\n\
print(sys.base_prefix)\n";

/// The interpreter workers actually run, as reported by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Interpreter {
    /// `sys.executable`. Launchers such as pyenv shims are scripts that fork,
    /// which workers may not do, so this is what gets spawned.
    pub executable: PathBuf,
    /// `sys.prefix` and `sys.base_prefix`, deduplicated.
    pub prefixes: Vec<PathBuf>,
}

impl Interpreter {
    pub fn read_roots(&self) -> ReadRoots {
        ReadRoots::new(&self.executable, &self.prefixes)
    }
}

/// Verify that the interpreter and base directory are usable before creating
/// the factory, returning the interpreter workers will run.
///
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub(crate) async fn check_prerequisites(
    config: &ProcessConfig,
) -> Result<Interpreter, SandboxError> {
    let mut errors = Vec::new();

    let mut interpreter = None;
    if let Some(python) = resolve_interpreter(&config.python, &mut errors) {
        check_executable(&python, &mut errors);
        interpreter = inspect(&python, &mut errors).await;
    }
    check_base_dir(&config.base_dir, &mut errors);
    if let Some(interpreter) = &interpreter {
        check_base_dir_is_private(&config.base_dir, &interpreter.read_roots(), &mut errors);
    }

    match interpreter {
        Some(interpreter) if errors.is_empty() => Ok(interpreter),
        _ => Err(SandboxError::BackendNotAvailable(errors.join("; "))),
    }
}

fn resolve_interpreter(python: &Path, errors: &mut Vec<String>) -> Option<PathBuf> {
    if python.components().count() > 1 {
        if python.exists() {
            return Some(python.to_path_buf());
        }
        errors.push(format!("python interpreter not found: {}", python.display()));
        return None;
    }
    match which::which(python) {
        Ok(path) => Some(path),
        Err(e) => {
            errors.push(format!("python interpreter {} not on PATH: {e}", python.display()));
            None
        }
    }
}

fn check_executable(path: &Path, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("python interpreter is not executable: {}", path.display()));
    }
}

async fn inspect(python: &Path, errors: &mut Vec<String>) -> Option<Interpreter> {
    let check = Command::new(python)
        .args(["-I", "-c", INSPECT_SCRIPT])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            errors.push(format!("python interpreter check failed: {}", output.status));
            return None;
        }
        Ok(Err(e)) => {
            errors.push(format!("python interpreter check failed: {e}"));
            return None;
        }
        Err(_) => {
            errors.push("python interpreter check timed out".to_string());
            return None;
        }
    };
    let reported = String::from_utf8_lossy(&output.stdout);
    let mut lines = reported.lines();
    match lines.next().and_then(parse_version) {
        Some(version) if version >= MIN_PYTHON => {}
        Some((major, minor)) => {
            errors.push(format!(
                "python {major}.{minor} is too old, need {}.{} or newer",
                MIN_PYTHON.0, MIN_PYTHON.1
            ));
            return None;
        }
        None => {
            errors.push(format!("unrecognized python version: {}", reported.trim()));
            return None;
        }
    }
    let executable = match lines.next().map(str::trim) {
        Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
        _ => {
            errors.push(format!("python did not report its executable: {}", reported.trim()));
            return None;
        }
    };
    let mut prefixes: Vec<PathBuf> = Vec::new();
    for prefix in lines.map(str::trim).filter(|p| !p.is_empty()) {
        let prefix = PathBuf::from(prefix);
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    Some(Interpreter {
        executable,
        prefixes,
    })
}

fn parse_version(text: &str) -> Option<(u32, u32)> {
    let (major, minor) = text.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn check_base_dir(base_dir: &Path, errors: &mut Vec<String>) {
    if let Err(e) = std::fs::create_dir_all(base_dir) {
        errors.push(format!("cannot create {}: {e}", base_dir.display()));
    }
}

/// Workers may read everything under their read roots, so worker
/// directories must not live there.
fn check_base_dir_is_private(base_dir: &Path, roots: &ReadRoots, errors: &mut Vec<String>) {
    if let Some(root) = roots.containing(base_dir) {
        errors.push(format!(
            "sandbox dir {} is inside {}, which every worker can read",
            base_dir.display(),
            root.display()
        ));
    }
}
