//! In-process step kinds: `write_file` and `replace`.

use crate::contract::{Exec, StepKind};
use crate::error::{EngineError, Result};
use crate::paths;
use regex::bytes::{NoExpand, Regex};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// What an internal step did, recorded in evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalOutcome {
    Wrote { path: PathBuf, bytes: usize },
    Replaced { path: PathBuf, occurrences: usize },
}

impl std::fmt::Display for InternalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InternalOutcome::Wrote { path, bytes } => {
                write!(f, "wrote {bytes} bytes to {}", path.display())
            }
            InternalOutcome::Replaced { path, occurrences: 0 } => {
                write!(f, "no occurrences in {}, file unchanged", path.display())
            }
            InternalOutcome::Replaced { path, occurrences } => {
                write!(f, "replaced {occurrences} occurrence(s) in {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct InternalStepRunner {
    root: PathBuf,
}

impl InternalStepRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run a validated internal step. External steps are not accepted here.
    pub fn run(&self, kind: &StepKind) -> Result<InternalOutcome> {
        match kind {
            StepKind::WriteFile { file_path, content } => {
                write_file(&paths::resolve(&self.root, file_path), content)
            }
            StepKind::Replace {
                file_path,
                old_string,
                new_string,
            } => replace(&paths::resolve(&self.root, file_path), old_string, new_string),
            StepKind::External { cmd, .. } => Err(EngineError::validation(
                cmd,
                format!("'{cmd}' is not an internal function"),
            )),
        }
    }

    /// Run an internal function straight from raw contract args. The args
    /// must be a mapping; anything else is a validation error.
    pub fn run_raw(&self, cmd: &str, args: &Value) -> Result<InternalOutcome> {
        let exec = Exec {
            cmd: cmd.to_string(),
            args: args.clone(),
        };
        let kind =
            StepKind::from_exec(&exec).map_err(|reason| EngineError::validation(cmd, reason))?;
        self.run(&kind)
    }
}

/// Overwrite `path` with `content` in full, creating parent directories.
pub fn write_file(path: &Path, content: &str) -> Result<InternalOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(InternalOutcome::Wrote {
        path: path.to_path_buf(),
        bytes: content.len(),
    })
}

/// Replace every occurrence of `old` with `new`. When `old` is absent the
/// file is not rewritten at all. Matching works on raw bytes, so files that
/// are not UTF-8 are handled too.
pub fn replace(path: &Path, old: &str, new: &str) -> Result<InternalOutcome> {
    let data = std::fs::read(path)?;
    if old.is_empty() {
        return Ok(InternalOutcome::Replaced {
            path: path.to_path_buf(),
            occurrences: 0,
        });
    }
    let needle = Regex::new(&regex::escape(old))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let occurrences = needle.find_iter(&data).count();
    if occurrences > 0 {
        std::fs::write(path, needle.replace_all(&data, NoExpand(new.as_bytes())))?;
    }
    Ok(InternalOutcome::Replaced {
        path: path.to_path_buf(),
        occurrences,
    })
}
