//! Allowlisted subprocess steps.
//!
//! Commands run without a shell: argv is passed as a list, the inherited
//! environment is cleared and replaced with the sandboxed one, and stdin is
//! closed. Spawning goes through [`ProcessSpawner`] so tests can observe or
//! forbid process creation.

use crate::error::SecurityError;
use crate::gate::SecurityPolicy;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Spawning seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub working_dir: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ProcessSpawner: Send + Sync {
    /// Run the process to completion and capture both streams. A program
    /// that cannot be found is reported as [`io::ErrorKind::NotFound`].
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<ProcessOutput>;
}

/// Spawns real processes via `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<ProcessOutput> {
        // Resolve against the sandboxed PATH, not ours.
        let resolved = which::which_in(
            request.program,
            request.env.get("PATH"),
            request.working_dir,
        )
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: {e}", request.program),
            )
        })?;

        let output = Command::new(&resolved)
            .args(request.args)
            .env_clear()
            .envs(request.env)
            .current_dir(request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// ExternalStepRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("command not found: {0}")]
    NotFound(String),

    #[error("failed to spawn '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("exited with code {}", .0.exit_code)]
    NonZeroExit(ProcessOutput),
}

pub struct ExternalStepRunner {
    policy: SecurityPolicy,
    spawner: Box<dyn ProcessSpawner>,
}

impl std::fmt::Debug for ExternalStepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalStepRunner")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ExternalStepRunner {
    pub fn new(policy: SecurityPolicy, spawner: Box<dyn ProcessSpawner>) -> Self {
        Self { policy, spawner }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Re-check the step gates for this exact invocation, then run it.
    /// A non-zero exit is an error that still carries the captured output.
    pub fn run(
        &self,
        cmd: &str,
        args: &[String],
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessOutput, ExternalError> {
        self.policy.check_step(cmd, args)?;

        tracing::debug!(cmd, args = ?args, cwd = %working_dir.display(), "spawning step");
        let request = SpawnRequest {
            program: cmd,
            args,
            working_dir,
            env,
        };
        let output = self.spawner.spawn(&request).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ExternalError::NotFound(cmd.to_string())
            } else {
                ExternalError::Spawn {
                    cmd: cmd.to_string(),
                    source: e,
                }
            }
        })?;

        if !output.success() {
            return Err(ExternalError::NonZeroExit(output));
        }
        Ok(output)
    }
}
