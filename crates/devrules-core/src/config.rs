use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// LockWait
// ---------------------------------------------------------------------------

/// What to do when another run holds a lock this run needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWait {
    #[default]
    Block,
    Fail,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Project configuration from `.devrules/config.yaml`. Every field has a
/// default so a missing or partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_locks_dir")]
    pub locks_dir: PathBuf,
    /// Appended to the built-in command allowlist.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Appended to the built-in environment allowlist.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default)]
    pub lock_wait: LockWait,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_RUNS_DIR)
}

fn default_locks_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_LOCKS_DIR)
}

fn default_max_output_chars() -> usize {
    4000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            locks_dir: default_locks_dir(),
            allowed_commands: Vec::new(),
            env_allowlist: Vec::new(),
            max_output_chars: default_max_output_chars(),
            lock_wait: LockWait::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    pub fn runs_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.runs_dir)
    }

    pub fn locks_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.locks_dir)
    }
}
