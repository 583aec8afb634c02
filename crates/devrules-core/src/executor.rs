//! The contract run state machine.
//!
//! ```text
//! Loaded -> GatesEvaluated -> LocksAcquired -> Running(i) -> Succeeded
//!    |            |                                  |
//!    +-> Aborted <+                                  +-> Failed
//! ```
//!
//! Gate failures abort before any target lock is taken and leave only an
//! `aborted` status record. A run also locks its own run directory, so two
//! runs of one task id never write evidence at the same time. Once locks are
//! held, every exit path releases them: the [`LockSet`] is dropped when
//! `run_locked` returns, whatever it returns.

use crate::config::{Config, LockWait};
use crate::contract::{Contract, Step, StepKind};
use crate::env::{self, EnvironmentBuilder};
use crate::error::{EngineError, Result};
use crate::evidence::{
    self, EvidenceRecorder, ExecKind, RunStatus, RunStatusDocument, StepRecord, StepStatus,
};
use crate::external::{ExternalError, ExternalStepRunner, ProcessSpawner, SystemSpawner};
use crate::gate::{self, GateCheck, PortProbe, SecurityPolicy, TcpPortProbe};
use crate::hasher;
use crate::internal::InternalStepRunner;
use crate::lock::{self, FileLockManager, LockSet};
use crate::paths;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Evaluate gates and report the step sequence. Nothing is locked or written.
    Plan,
    /// Ask a [`Confirm`] implementation before taking locks.
    Confirm,
    /// Run unattended.
    #[default]
    Execute,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Plan => "plan",
            ExecutionMode::Confirm => "confirm",
            ExecutionMode::Execute => "execute",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plan" => Ok(ExecutionMode::Plan),
            "confirm" => Ok(ExecutionMode::Confirm),
            "execute" => Ok(ExecutionMode::Execute),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: String,
    pub description: String,
    pub kind: ExecKind,
    pub summary: String,
}

/// What a run would do, as known after the gates pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub title: String,
    pub plan_fingerprint: String,
    pub gates: Vec<GateCheck>,
    pub lock_targets: Vec<String>,
    pub steps: Vec<PlannedStep>,
}

/// External acknowledgement for [`ExecutionMode::Confirm`].
pub trait Confirm {
    fn confirm(&self, plan: &Plan) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&Plan) -> bool,
{
    fn confirm(&self, plan: &Plan) -> bool {
        self(plan)
    }
}

/// Declines every plan. The default, so confirm mode never proceeds by accident.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&self, _plan: &Plan) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Options / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: ExecutionMode,
    /// Refuse to run unless the current plan fingerprint equals this one.
    pub approved_fingerprint: Option<String>,
    /// Overrides `Config::lock_wait` for this run.
    pub lock_wait: Option<LockWait>,
}

impl RunOptions {
    pub fn mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    Planned(Plan),
    Succeeded {
        plan: Plan,
        status: RunStatusDocument,
    },
}

impl RunReport {
    pub fn plan(&self) -> &Plan {
        match self {
            RunReport::Planned(plan) | RunReport::Succeeded { plan, .. } => plan,
        }
    }
}

// ---------------------------------------------------------------------------
// ContractExecutor
// ---------------------------------------------------------------------------

pub struct ContractExecutor {
    root: PathBuf,
    config: Config,
    host_env: BTreeMap<String, String>,
    env_builder: EnvironmentBuilder,
    internal: InternalStepRunner,
    external: ExternalStepRunner,
    probe: Box<dyn PortProbe>,
    confirmer: Box<dyn Confirm>,
    locks: FileLockManager,
}

impl std::fmt::Debug for ContractExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractExecutor")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContractExecutor {
    /// Executor for `root` that sees the real host environment, spawns real
    /// processes, and probes real ports.
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        let root = root.into();
        let policy = SecurityPolicy::with_extra(config.allowed_commands.iter().cloned());
        Self {
            env_builder: EnvironmentBuilder::with_extra(config.env_allowlist.iter().cloned()),
            internal: InternalStepRunner::new(&root),
            external: ExternalStepRunner::new(policy, Box::new(SystemSpawner)),
            probe: Box::new(TcpPortProbe::default()),
            confirmer: Box::new(Decline),
            locks: FileLockManager::new(config.locks_dir(&root)),
            host_env: env::host_env(),
            root,
            config,
        }
    }

    /// [`ContractExecutor::new`] with the project's `.devrules/config.yaml`.
    pub fn from_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Config::load(&root)?;
        Ok(Self::new(root, config))
    }

    pub fn with_host_env(mut self, host_env: BTreeMap<String, String>) -> Self {
        self.host_env = host_env;
        self
    }

    pub fn with_spawner(mut self, spawner: impl ProcessSpawner + 'static) -> Self {
        let policy = self.external.policy().clone();
        self.external = ExternalStepRunner::new(policy, Box::new(spawner));
        self
    }

    pub fn with_port_probe(mut self, probe: impl PortProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_confirmer(mut self, confirmer: impl Confirm + 'static) -> Self {
        self.confirmer = Box::new(confirmer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.config.runs_dir(&self.root)
    }

    pub fn lock_manager(&self) -> &FileLockManager {
        &self.locks
    }

    /// Lock key of the evidence directory for `task_id`.
    pub fn run_lock_target(&self, task_id: &str) -> String {
        lock::lock_key(&self.root, paths::run_dir(&self.runs_dir(), task_id))
    }

    /// Validate the contract and evaluate every gate. Never writes anything.
    pub fn plan(&self, contract: &Contract) -> Result<Plan> {
        let steps = contract.validate()?;
        let fingerprint = hasher::plan_fingerprint(contract)?;
        let gates = self.evaluate_gates(contract, &steps)?;
        Ok(self.build_plan(contract, &steps, fingerprint, gates))
    }

    pub fn execute(&self, contract: &Contract, options: &RunOptions) -> Result<RunReport> {
        let steps = contract.validate()?;
        let task_id = contract.task_id.as_str();
        let fingerprint = hasher::plan_fingerprint(contract)?;
        tracing::info!(
            task_id,
            fingerprint = %fingerprint,
            mode = %options.mode,
            "contract loaded"
        );

        let gates = match self.evaluate_gates(contract, &steps) {
            Ok(gates) => gates,
            Err(err) => {
                tracing::warn!(task_id, error = %err, "gate failed, aborting");
                if options.mode != ExecutionMode::Plan {
                    self.record_abort(task_id, &fingerprint, steps.len(), &err)?;
                }
                return Err(err);
            }
        };
        let plan = self.build_plan(contract, &steps, fingerprint, gates);
        tracing::info!(task_id, "gates evaluated");

        if options.mode == ExecutionMode::Plan {
            return Ok(RunReport::Planned(plan));
        }

        if let Some(approved) = &options.approved_fingerprint {
            let approved = approved.trim().to_ascii_lowercase();
            if approved != plan.plan_fingerprint {
                let err = EngineError::PlanMismatch {
                    expected: approved,
                    actual: plan.plan_fingerprint.clone(),
                };
                self.abort(&plan, &err)?;
                return Err(err);
            }
        }

        if options.mode == ExecutionMode::Confirm && !self.confirmer.confirm(&plan) {
            let err = EngineError::NotConfirmed(task_id.to_string());
            self.abort(&plan, &err)?;
            return Err(err);
        }

        let wait = options.lock_wait.unwrap_or(self.config.lock_wait);
        let mut targets: BTreeSet<String> = plan.lock_targets.iter().cloned().collect();
        targets.insert(self.run_lock_target(task_id));
        let locks = self.locks.acquire_all(&targets, wait)?;
        tracing::info!(task_id, locks = locks.len(), "locks acquired");

        let status = self.run_locked(contract, &steps, &plan, options.mode, locks)?;
        Ok(RunReport::Succeeded { plan, status })
    }

    /// `Running(i)` through to `Succeeded` or `Failed`. Owns the lock set,
    /// which is released when this returns.
    fn run_locked(
        &self,
        contract: &Contract,
        steps: &[Step],
        plan: &Plan,
        mode: ExecutionMode,
        mut locks: LockSet,
    ) -> Result<RunStatusDocument> {
        let task_id = contract.task_id.as_str();
        let mut recorder = EvidenceRecorder::begin(
            &self.runs_dir(),
            task_id,
            &contract.title,
            &plan.plan_fingerprint,
            mode,
            steps.len(),
        )?;
        let child_env = self.env_builder.build(&self.host_env);

        for step in steps {
            tracing::info!(
                task_id,
                step_id = %step.id,
                command = step.kind.command_name(),
                "running step"
            );
            let (record, failure) = self.run_step(task_id, step, &child_env);
            recorder.record(record)?;

            if let Some(err) = failure {
                tracing::warn!(task_id, step_id = %step.id, error = %err, "step failed");
                recorder.finalize(
                    RunStatus::Failed,
                    Some(step.id.clone()),
                    Some(err.to_string()),
                    BTreeMap::new(),
                )?;
                locks.release_all();
                return Err(err);
            }
        }

        let checksums = self.evidence_checksums(&contract.evidence);
        let status = finish(recorder, checksums);
        locks.release_all();
        let status = status?;
        tracing::info!(task_id, steps = steps.len(), "run succeeded");
        Ok(status)
    }

    /// Dispatch one step. Returns its evidence record and, if it failed, the
    /// error that ends the run.
    fn run_step(
        &self,
        task_id: &str,
        step: &Step,
        child_env: &BTreeMap<String, String>,
    ) -> (StepRecord, Option<EngineError>) {
        let started_at = Utc::now();
        let clock = Instant::now();
        let limit = self.config.max_output_chars;
        let mut record = StepRecord {
            id: step.id.clone(),
            description: step.description.clone(),
            kind: exec_kind(&step.kind),
            command: step.kind.summary(),
            status: StepStatus::Success,
            exit_code: None,
            result: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at,
            duration_ms: 0,
        };

        let failure = match &step.kind {
            StepKind::External { cmd, args } => {
                match self.external.run(cmd, args, &self.root, child_env) {
                    Ok(output) => {
                        record.exit_code = Some(output.exit_code);
                        record.stdout = evidence::truncate_tail(&output.stdout, limit);
                        record.stderr = evidence::truncate_tail(&output.stderr, limit);
                        None
                    }
                    Err(ExternalError::NonZeroExit(output)) => {
                        let stderr = evidence::truncate_tail(&output.stderr, limit);
                        record.exit_code = Some(output.exit_code);
                        record.stdout = evidence::truncate_tail(&output.stdout, limit);
                        record.stderr = stderr.clone();
                        Some(EngineError::Execution {
                            task_id: task_id.to_string(),
                            step_id: step.id.clone(),
                            reason: format!("'{cmd}' exited with code {}", output.exit_code),
                            exit_code: Some(output.exit_code),
                            stderr,
                        })
                    }
                    Err(ExternalError::Security(source)) => {
                        Some(EngineError::security(task_id, Some(&step.id), source))
                    }
                    Err(ExternalError::NotFound(cmd)) => Some(EngineError::CommandNotFound {
                        task_id: task_id.to_string(),
                        step_id: step.id.clone(),
                        cmd,
                    }),
                    Err(err @ ExternalError::Spawn { .. }) => Some(EngineError::Execution {
                        task_id: task_id.to_string(),
                        step_id: step.id.clone(),
                        reason: err.to_string(),
                        exit_code: None,
                        stderr: String::new(),
                    }),
                }
            }
            internal => match self.internal.run(internal) {
                Ok(outcome) => {
                    record.result = Some(outcome.to_string());
                    None
                }
                Err(err) => Some(EngineError::Execution {
                    task_id: task_id.to_string(),
                    step_id: step.id.clone(),
                    reason: err.to_string(),
                    exit_code: None,
                    stderr: String::new(),
                }),
            },
        };

        if let Some(err) = &failure {
            record.status = StepStatus::Failed;
            if record.result.is_none() {
                record.result = Some(err.to_string());
            }
        }
        record.duration_ms = clock.elapsed().as_millis() as u64;
        (record, failure)
    }

    fn evaluate_gates(&self, contract: &Contract, steps: &[Step]) -> Result<Vec<GateCheck>> {
        let task_id = contract.task_id.as_str();
        let contract_gate = |e| EngineError::security(task_id, None, e);

        let mut checks = vec![
            gate::check_secrets(&contract.secrets_required, &self.host_env)
                .map_err(contract_gate)?,
            gate::check_ports(&contract.ports_should_be_free, self.probe.as_ref())
                .map_err(contract_gate)?,
        ];
        for step in steps {
            if let StepKind::External { cmd, args } = &step.kind {
                let step_checks = self
                    .external
                    .policy()
                    .check_step(cmd, args)
                    .map_err(|e| EngineError::security(task_id, Some(&step.id), e))?;
                checks.extend(step_checks);
            }
        }
        Ok(checks)
    }

    fn build_plan(
        &self,
        contract: &Contract,
        steps: &[Step],
        plan_fingerprint: String,
        gates: Vec<GateCheck>,
    ) -> Plan {
        Plan {
            task_id: contract.task_id.clone(),
            title: contract.title.clone(),
            plan_fingerprint,
            gates,
            lock_targets: lock::collect_targets(&self.root, &contract.evidence, steps)
                .into_iter()
                .collect(),
            steps: steps
                .iter()
                .map(|s| PlannedStep {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    kind: exec_kind(&s.kind),
                    summary: s.kind.summary(),
                })
                .collect(),
        }
    }

    fn abort(&self, plan: &Plan, err: &EngineError) -> Result<()> {
        tracing::warn!(task_id = %plan.task_id, error = %err, "run aborted");
        self.record_abort(&plan.task_id, &plan.plan_fingerprint, plan.steps.len(), err)
    }

    /// Write the `aborted` status under the run directory lock. If another
    /// run of the same task holds it, its evidence is left alone.
    fn record_abort(
        &self,
        task_id: &str,
        fingerprint: &str,
        steps_total: usize,
        err: &EngineError,
    ) -> Result<()> {
        let target = self.run_lock_target(task_id);
        let _guard = match self.locks.acquire(&target, LockWait::Fail) {
            Ok(guard) => guard,
            Err(EngineError::LockHeld { .. }) => {
                tracing::warn!(
                    task_id,
                    "another run of this task is in progress, abort not recorded"
                );
                return Ok(());
            }
            Err(other) => return Err(other),
        };
        evidence::record_abort(
            &self.runs_dir(),
            task_id,
            fingerprint,
            steps_total,
            &err.to_string(),
        )?;
        Ok(())
    }

    fn evidence_checksums(&self, declared: &[String]) -> Result<BTreeMap<String, String>> {
        let mut checksums = BTreeMap::new();
        for path in declared {
            if path.contains(['*', '?', '[']) {
                continue;
            }
            let resolved = paths::resolve(&self.root, path);
            if resolved.is_file() {
                checksums.insert(path.clone(), hasher::file_checksum(&resolved)?);
            }
        }
        Ok(checksums)
    }
}

/// Close a run whose steps all passed. A checksum failure still leaves a
/// `failed` status behind before the error is returned.
fn finish(
    recorder: EvidenceRecorder,
    checksums: Result<BTreeMap<String, String>>,
) -> Result<RunStatusDocument> {
    match checksums {
        Ok(checksums) => recorder.finalize(RunStatus::Success, None, None, checksums),
        Err(err) => {
            tracing::warn!(error = %err, "evidence checksum failed");
            recorder.finalize(
                RunStatus::Failed,
                None,
                Some(format!("evidence checksum failed: {err}")),
                BTreeMap::new(),
            )?;
            Err(err)
        }
    }
}

fn exec_kind(kind: &StepKind) -> ExecKind {
    if kind.is_internal() {
        ExecKind::Internal
    } else {
        ExecKind::External
    }
}
