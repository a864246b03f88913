//! Landlock filesystem rules for workers.
//!
//! A worker may read system libraries and the interpreter's install tree,
//! read and delete files in its own directory, write its result file, and do
//! anything under its scratch directory. All TCP bind and connect is refused.
//! Nothing else on the host is reachable.

use std::path::{Path, PathBuf};

use landlock::{
    ABI, Access, AccessFs, AccessNet, BitFlags, CompatLevel, Compatible, PathBeneath, PathFd,
    Ruleset, RulesetAttr, RulesetCreated, RulesetCreatedAttr, RulesetError,
};

use crate::paths::WorkerPaths;

const ABI_VERSION: ABI = ABI::V4;

const SYSTEM_DIRS: [&str; 4] = ["/usr", "/lib", "/lib64", "/bin"];
const SYSTEM_FILES: [&str; 4] = [
    "/etc/ld.so.cache",
    "/etc/ld.so.preload",
    "/etc/localtime",
    "/dev/urandom",
];

/// What a worker may read outside its own directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadRoots {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

impl ReadRoots {
    /// System locations plus the interpreter's executable and prefixes.
    pub fn new(executable: &Path, prefixes: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = SYSTEM_DIRS.iter().map(PathBuf::from).collect();
        for prefix in prefixes {
            if !dirs.iter().any(|d| prefix.starts_with(d)) {
                dirs.push(prefix.clone());
            }
        }
        let mut files: Vec<PathBuf> = SYSTEM_FILES.iter().map(PathBuf::from).collect();
        files.push(executable.to_path_buf());
        Self { dirs, files }
    }

    /// The read root containing `path`, if any. Both sides are resolved
    /// through symlinks where they exist.
    pub fn containing(&self, path: &Path) -> Option<&Path> {
        let path = canonical(path);
        self.dirs
            .iter()
            .find(|dir| path.starts_with(canonical(dir)))
            .map(PathBuf::as_path)
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Build the ruleset for one worker. `restrict_self` happens in the child.
///
/// Best effort: on kernels without Landlock (or with an older ABI) the
/// ruleset enforces what it can, possibly nothing.
pub(crate) fn worker_ruleset(
    roots: &ReadRoots,
    paths: &WorkerPaths,
) -> Result<RulesetCreated, RulesetError> {
    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(ABI_VERSION))?
        .handle_access(AccessNet::from_all(ABI_VERSION))?
        .create()?;

    for dir in &roots.dirs {
        ruleset = allow(ruleset, dir, AccessFs::from_read(ABI_VERSION))?;
    }
    for file in &roots.files {
        ruleset = allow(ruleset, file, AccessFs::Execute | AccessFs::ReadFile)?;
    }
    ruleset = allow(
        ruleset,
        Path::new("/dev/null"),
        AccessFs::ReadFile | AccessFs::WriteFile | AccessFs::Truncate,
    )?;
    ruleset = allow(
        ruleset,
        paths.dir(),
        AccessFs::ReadFile | AccessFs::ReadDir | AccessFs::RemoveFile,
    )?;
    ruleset = allow(
        ruleset,
        &paths.result(),
        AccessFs::ReadFile | AccessFs::WriteFile | AccessFs::Truncate,
    )?;
    allow(ruleset, &paths.scratch(), AccessFs::from_all(ABI_VERSION))
}

/// Paths missing on this host are skipped.
fn allow(
    ruleset: RulesetCreated,
    path: &Path,
    access: BitFlags<AccessFs>,
) -> Result<RulesetCreated, RulesetError> {
    match PathFd::new(path) {
        Ok(fd) => ruleset.add_rule(PathBeneath::new(fd, access)),
        Err(_) => Ok(ruleset),
    }
}

/// Whether the running kernel enforces Landlock at all.
pub(crate) fn landlock_supported() -> bool {
    Ruleset::default()
        .set_compatibility(CompatLevel::HardRequirement)
        .handle_access(AccessFs::from_all(ABI::V1))
        .and_then(|ruleset| ruleset.create())
        .is_ok()
}
