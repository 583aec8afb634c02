//! Contract documents and their validated step form.
//!
//! A contract is parsed as-is from YAML into [`Contract`], which keeps the
//! document shape (including unknown keys) so it can be fingerprinted. Before
//! anything runs, [`Contract::validate`] resolves every command into a tagged
//! [`StepKind`], so dispatch never has to look at command name strings again.

use crate::error::{EngineError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Command names executed in-process instead of as a subprocess.
pub const INTERNAL_COMMANDS: [&str; 2] = ["write_file", "replace"];

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub secrets_required: Vec<String>,
    #[serde(default)]
    pub ports_should_be_free: Vec<u16>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Keys this engine does not interpret. Kept so they count toward the
    /// plan fingerprint.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub exec: Exec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exec {
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

// ---------------------------------------------------------------------------
// Validated steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    WriteFile {
        file_path: String,
        content: String,
    },
    Replace {
        file_path: String,
        old_string: String,
        new_string: String,
    },
    External {
        cmd: String,
        args: Vec<String>,
    },
}

impl StepKind {
    /// Resolve one `exec` block. The error is a human-readable reason.
    pub fn from_exec(exec: &Exec) -> std::result::Result<Self, String> {
        resolve_kind(exec)
    }

    pub fn is_internal(&self) -> bool {
        !matches!(self, StepKind::External { .. })
    }

    pub fn command_name(&self) -> &str {
        match self {
            StepKind::WriteFile { .. } => "write_file",
            StepKind::Replace { .. } => "replace",
            StepKind::External { cmd, .. } => cmd,
        }
    }

    /// The file an internal step mutates.
    pub fn target_path(&self) -> Option<&str> {
        match self {
            StepKind::WriteFile { file_path, .. } | StepKind::Replace { file_path, .. } => {
                Some(file_path)
            }
            StepKind::External { .. } => None,
        }
    }

    /// One-line human-readable rendering, used by plan output and evidence.
    pub fn summary(&self) -> String {
        match self {
            StepKind::WriteFile { file_path, content } => {
                format!("write_file {file_path} ({} bytes)", content.len())
            }
            StepKind::Replace {
                file_path,
                old_string,
                ..
            } => format!("replace {old_string:?} in {file_path}"),
            StepKind::External { cmd, args } if args.is_empty() => cmd.clone(),
            StepKind::External { cmd, args } => format!("{cmd} {}", args.join(" ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub kind: StepKind,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Contract {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(EngineError::ContractNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Check contract-validity invariants and resolve every command into a
    /// [`Step`]. Nothing is executed or touched on disk.
    pub fn validate(&self) -> Result<Vec<Step>> {
        let task_id = self.task_id.as_str();
        if !paths::is_safe_task_id(task_id) {
            return Err(EngineError::validation(
                task_id,
                "task_id must be non-empty and contain only letters, digits, '.', '_' or '-'",
            ));
        }
        if self.commands.is_empty() {
            return Err(EngineError::validation(task_id, "contract has no commands"));
        }
        for name in &self.secrets_required {
            if name.trim().is_empty() {
                return Err(EngineError::validation(task_id, "empty secret name"));
            }
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(self.commands.len());
        for (index, command) in self.commands.iter().enumerate() {
            let id = command.id.trim();
            if id.is_empty() {
                return Err(EngineError::validation(
                    task_id,
                    format!("command #{} has no id", index + 1),
                ));
            }
            if !seen.insert(id.to_string()) {
                return Err(EngineError::validation(
                    task_id,
                    format!("duplicate command id '{id}'"),
                ));
            }
            let kind = resolve_kind(&command.exec).map_err(|reason| {
                EngineError::validation(task_id, format!("command '{id}': {reason}"))
            })?;
            steps.push(Step {
                id: id.to_string(),
                description: command.description.clone(),
                kind,
            });
        }
        Ok(steps)
    }
}

fn resolve_kind(exec: &Exec) -> std::result::Result<StepKind, String> {
    let cmd = exec.cmd.trim();
    if cmd.is_empty() {
        return Err("exec.cmd is empty".to_string());
    }
    if INTERNAL_COMMANDS.contains(&cmd) {
        let Value::Object(map) = &exec.args else {
            return Err(format!(
                "internal function '{cmd}' requires mapping args, got {}",
                value_kind(&exec.args)
            ));
        };
        let field = |key: &str| -> std::result::Result<String, String> {
            match map.get(key) {
                Some(v) => scalar_to_string(v)
                    .ok_or_else(|| format!("argument '{key}' must be a scalar")),
                None => Err(format!("missing argument '{key}' for '{cmd}'")),
            }
        };
        let file_path = field("file_path")?;
        if file_path.trim().is_empty() {
            return Err("argument 'file_path' is empty".to_string());
        }
        return if cmd == "write_file" {
            Ok(StepKind::WriteFile {
                file_path,
                content: field("content")?,
            })
        } else {
            let old_string = field("old_string")?;
            if old_string.is_empty() {
                return Err("argument 'old_string' is empty".to_string());
            }
            Ok(StepKind::Replace {
                file_path,
                old_string,
                new_string: field("new_string")?,
            })
        };
    }

    Ok(StepKind::External {
        cmd: cmd.to_string(),
        args: render_external_args(&exec.args)?,
    })
}

/// Flatten external args into argv. Sequences pass through in order; a
/// mapping becomes `--key value` pairs in key order, `true` becomes a bare
/// `--key`, and `false`/null drop the flag.
fn render_external_args(args: &Value) -> std::result::Result<Vec<String>, String> {
    match args {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|v| scalar_to_string(v).ok_or_else(|| "args must be scalars".to_string()))
            .collect(),
        Value::Object(map) => {
            let mut argv = Vec::new();
            for (key, value) in map {
                match value {
                    Value::Bool(true) => argv.push(format!("--{key}")),
                    Value::Bool(false) | Value::Null => {}
                    other => {
                        let rendered = scalar_to_string(other)
                            .ok_or_else(|| format!("argument '{key}' must be a scalar"))?;
                        argv.push(format!("--{key}"));
                        argv.push(rendered);
                    }
                }
            }
            Ok(argv)
        }
        other => Ok(vec![scalar_to_string(other).unwrap_or_default()]),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "nothing",
        Value::Bool(_) | Value::Number(_) | Value::String(_) => "a scalar",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
