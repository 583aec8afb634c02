//! Run evidence under `<runs_dir>/<task_id>/`.
//!
//! Two JSON documents are kept per task:
//!   evidence.json: run header plus one record per attempted step, in order
//!   status.json: final run status, written once at the end
//!
//! Every write goes through [`io::atomic_write_json`], so a reader sees either
//! the previous version of a document or the complete new one.

use crate::error::{EngineError, Result};
use crate::executor::ExecutionMode;
use crate::hasher;
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecKind {
    Internal,
    External,
}

impl ExecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecKind::Internal => "internal",
            ExecKind::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub kind: ExecKind,
    pub command: String,
    pub status: StepStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Summary of what an internal step did, or why a step failed.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub run_id: Uuid,
    pub task_id: String,
    #[serde(default)]
    pub title: String,
    pub plan_fingerprint: String,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl EvidenceDocument {
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusDocument {
    /// Absent when the run never started (gate abort).
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub task_id: String,
    pub status: RunStatus,
    pub plan_fingerprint: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub steps_completed: usize,
    #[serde(default)]
    pub steps_total: usize,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// SHA-256 of each declared evidence path that existed at the end of a
    /// successful run.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// EvidenceRecorder
// ---------------------------------------------------------------------------

/// Owns the evidence document of one run for the duration of that run.
#[derive(Debug)]
pub struct EvidenceRecorder {
    runs_dir: PathBuf,
    steps_total: usize,
    doc: EvidenceDocument,
}

impl EvidenceRecorder {
    /// Start a run: clear documents left by a previous run of the same task
    /// and write the empty evidence shell.
    pub fn begin(
        runs_dir: &Path,
        task_id: &str,
        title: &str,
        plan_fingerprint: &str,
        mode: ExecutionMode,
        steps_total: usize,
    ) -> Result<Self> {
        io::ensure_dir(&paths::run_dir(runs_dir, task_id))?;
        io::remove_if_exists(&paths::status_path(runs_dir, task_id))?;
        let recorder = Self {
            runs_dir: runs_dir.to_path_buf(),
            steps_total,
            doc: EvidenceDocument {
                run_id: Uuid::new_v4(),
                task_id: task_id.to_string(),
                title: title.to_string(),
                plan_fingerprint: plan_fingerprint.to_string(),
                mode,
                started_at: Utc::now(),
                steps: Vec::new(),
            },
        };
        recorder.flush()?;
        tracing::debug!(task_id, run_id = %recorder.doc.run_id, "evidence started");
        Ok(recorder)
    }

    pub fn document(&self) -> &EvidenceDocument {
        &self.doc
    }

    pub fn evidence_path(&self) -> PathBuf {
        paths::evidence_path(&self.runs_dir, &self.doc.task_id)
    }

    /// Append one step outcome and persist the whole document.
    pub fn record(&mut self, record: StepRecord) -> Result<()> {
        self.doc.steps.push(record);
        self.flush()
    }

    /// Write the final status document. Consumes the recorder; nothing may be
    /// appended after this.
    pub fn finalize(
        self,
        status: RunStatus,
        failed_step: Option<String>,
        reason: Option<String>,
        checksums: BTreeMap<String, String>,
    ) -> Result<RunStatusDocument> {
        let doc = RunStatusDocument {
            run_id: Some(self.doc.run_id),
            task_id: self.doc.task_id.clone(),
            status,
            plan_fingerprint: self.doc.plan_fingerprint.clone(),
            started_at: Some(self.doc.started_at),
            finished_at: Utc::now(),
            steps_completed: self.doc.completed_steps(),
            steps_total: self.steps_total,
            failed_step,
            reason,
            checksums,
        };
        io::atomic_write_json(&paths::status_path(&self.runs_dir, &doc.task_id), &doc)?;
        Ok(doc)
    }

    fn flush(&self) -> Result<()> {
        io::atomic_write_json(&self.evidence_path(), &self.doc)
    }
}

/// Record a run that was stopped before it started. Only `status.json` is
/// written; a stale `evidence.json` from an earlier run is removed so the
/// directory describes this attempt alone.
pub fn record_abort(
    runs_dir: &Path,
    task_id: &str,
    plan_fingerprint: &str,
    steps_total: usize,
    reason: &str,
) -> Result<RunStatusDocument> {
    io::remove_if_exists(&paths::evidence_path(runs_dir, task_id))?;
    let doc = RunStatusDocument {
        run_id: None,
        task_id: task_id.to_string(),
        status: RunStatus::Aborted,
        plan_fingerprint: plan_fingerprint.to_string(),
        started_at: None,
        finished_at: Utc::now(),
        steps_completed: 0,
        steps_total,
        failed_step: None,
        reason: Some(format!("aborted: {reason}")),
        checksums: BTreeMap::new(),
    };
    io::atomic_write_json(&paths::status_path(runs_dir, task_id), &doc)?;
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

pub fn load_evidence(runs_dir: &Path, task_id: &str) -> Result<Option<EvidenceDocument>> {
    load_json(&paths::evidence_path(runs_dir, task_id))
}

pub fn load_status(runs_dir: &Path, task_id: &str) -> Result<Option<RunStatusDocument>> {
    load_json(&paths::status_path(runs_dir, task_id))
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumState {
    Ok,
    Modified,
    Missing,
}

impl ChecksumState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumState::Ok => "ok",
            ChecksumState::Modified => "modified",
            ChecksumState::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumCheck {
    pub path: String,
    pub state: ChecksumState,
}

/// Re-hash every path recorded in the task's final status.
pub fn verify(root: &Path, runs_dir: &Path, task_id: &str) -> Result<Vec<ChecksumCheck>> {
    let status = load_status(runs_dir, task_id)?
        .ok_or_else(|| EngineError::EvidenceNotFound(task_id.to_string()))?;
    let mut checks = Vec::with_capacity(status.checksums.len());
    for (path, expected) in &status.checksums {
        let resolved = paths::resolve(root, path);
        let state = if !resolved.is_file() {
            ChecksumState::Missing
        } else if &hasher::file_checksum(&resolved)? == expected {
            ChecksumState::Ok
        } else {
            ChecksumState::Modified
        };
        checks.push(ChecksumCheck {
            path: path.clone(),
            state,
        });
    }
    Ok(checks)
}

/// Keep the last `max_chars` characters of captured output, marking the cut.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("[truncated {skip} chars]\n{tail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
