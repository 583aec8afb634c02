use std::path::PathBuf;
use thiserror::Error;

/// A pre-mutation gate refused to let the run proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("missing required secret: {0}")]
    MissingSecret(String),

    #[error("port already in use: {0}")]
    PortInUse(u16),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("dangerous pattern detected: {pattern}")]
    DangerousPattern { pattern: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("contract not found: {}", .0.display())]
    ContractNotFound(PathBuf),

    #[error("security gate failed for task '{task_id}'{}: {source}", step_suffix(.step_id))]
    Security {
        task_id: String,
        step_id: Option<String>,
        #[source]
        source: SecurityError,
    },

    #[error("invalid contract '{task_id}': {reason}")]
    Validation { task_id: String, reason: String },

    #[error("step '{step_id}' of task '{task_id}' failed: {reason}")]
    Execution {
        task_id: String,
        step_id: String,
        reason: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("command '{cmd}' not found on the sandboxed PATH (task '{task_id}', step '{step_id}')")]
    CommandNotFound {
        task_id: String,
        step_id: String,
        cmd: String,
    },

    #[error("lock held by another run: {path}")]
    LockHeld { path: String },

    #[error("run of task '{0}' was not confirmed")]
    NotConfirmed(String),

    #[error("plan fingerprint mismatch: approved {expected}, current {actual}")]
    PlanMismatch { expected: String, actual: String },

    #[error("no evidence recorded for task '{0}'")]
    EvidenceNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn step_suffix(step_id: &Option<String>) -> String {
    match step_id {
        Some(id) => format!(" (step '{id}')"),
        None => String::new(),
    }
}

impl EngineError {
    pub(crate) fn validation(task_id: &str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            task_id: task_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn security(task_id: &str, step_id: Option<&str>, source: SecurityError) -> Self {
        EngineError::Security {
            task_id: task_id.to_string(),
            step_id: step_id.map(str::to_string),
            source,
        }
    }

    /// Process exit code a caller should use for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Security { .. } => 2,
            EngineError::Execution { .. } => 3,
            EngineError::ContractNotFound(_)
            | EngineError::CommandNotFound { .. }
            | EngineError::EvidenceNotFound(_) => 4,
            EngineError::Validation { .. } | EngineError::Yaml(_) => 5,
            EngineError::LockHeld { .. } => 6,
            EngineError::NotConfirmed(_) | EngineError::PlanMismatch { .. } => 7,
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => 4,
            EngineError::Io(_) | EngineError::Json(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
