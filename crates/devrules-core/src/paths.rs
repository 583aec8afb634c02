use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DEVRULES_DIR: &str = ".devrules";
pub const CONFIG_FILE: &str = ".devrules/config.yaml";
pub const DEFAULT_LOCKS_DIR: &str = ".devrules/locks";
pub const DEFAULT_RUNS_DIR: &str = "RUNS";

pub const EVIDENCE_FILE: &str = "evidence.json";
pub const STATUS_FILE: &str = "status.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn run_dir(runs_dir: &Path, task_id: &str) -> PathBuf {
    runs_dir.join(task_id)
}

pub fn evidence_path(runs_dir: &Path, task_id: &str) -> PathBuf {
    run_dir(runs_dir, task_id).join(EVIDENCE_FILE)
}

pub fn status_path(runs_dir: &Path, task_id: &str) -> PathBuf {
    run_dir(runs_dir, task_id).join(STATUS_FILE)
}

/// Resolve a contract-relative path against the project root.
/// Absolute paths are returned unchanged.
pub fn resolve(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Fold `.` and `..` segments without touching the filesystem. Symlinks are
/// not followed. A `..` above the root of an absolute path is dropped.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `path` as an absolute path, joined onto the current directory if needed.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Task id validation
// ---------------------------------------------------------------------------

static TASK_ID_RE: OnceLock<Regex> = OnceLock::new();

fn task_id_re() -> &'static Regex {
    TASK_ID_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").expect("task id pattern is valid")
    })
}

/// A task id doubles as a directory name under the runs dir, so it must not
/// contain separators, start with a dot, or be empty.
pub fn is_safe_task_id(task_id: &str) -> bool {
    !task_id.is_empty() && task_id.len() <= 128 && task_id_re().is_match(task_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
