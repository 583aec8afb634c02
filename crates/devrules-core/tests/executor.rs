use devrules_core::config::{Config, LockWait};
use devrules_core::evidence::{self, RunStatus, StepStatus};
use devrules_core::external::{ProcessOutput, ProcessSpawner, SpawnRequest};
use devrules_core::gate::PortProbe;
use devrules_core::{
    Contract, ContractExecutor, EngineError, ExecutionMode, RunOptions, RunReport, SecurityError,
};
use std::collections::BTreeMap;
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Spawned {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

/// Records every spawn. Calls whose args contain "fail" exit with code 1.
#[derive(Clone, Default)]
struct RecordingSpawner {
    calls: Arc<Mutex<Vec<Spawned>>>,
}

impl RecordingSpawner {
    fn calls(&self) -> Vec<Spawned> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessSpawner for RecordingSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> io::Result<ProcessOutput> {
        self.calls.lock().unwrap().push(Spawned {
            program: request.program.to_string(),
            args: request.args.to_vec(),
            env: request.env.clone(),
        });
        let failing = request.args.iter().any(|a| a == "fail");
        Ok(ProcessOutput {
            exit_code: if failing { 1 } else { 0 },
            stdout: format!("ran {}", request.program),
            stderr: if failing {
                "AssertionError: expected 2 got 3".to_string()
            } else {
                String::new()
            },
        })
    }
}

struct FreePorts;

impl PortProbe for FreePorts {
    fn is_bound(&self, _port: u16) -> bool {
        false
    }
}

fn host_env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn executor(root: &Path, spawner: &RecordingSpawner) -> ContractExecutor {
    ContractExecutor::new(root, Config::default())
        .with_host_env(host_env(&[("PATH", "/usr/bin:/bin")]))
        .with_spawner(spawner.clone())
        .with_port_probe(FreePorts)
}

fn execute(exec: &ContractExecutor, yaml: &str) -> devrules_core::Result<RunReport> {
    let contract = Contract::from_yaml_str(yaml).unwrap();
    exec.execute(&contract, &RunOptions::mode(ExecutionMode::Execute))
}

fn lock_files(root: &Path) -> usize {
    match std::fs::read_dir(root.join(".devrules/locks")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn write_file_contract_produces_file_and_one_success_record() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T1
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {file_path: out.txt, content: hello}
"#;
    let report = execute(&executor(dir.path(), &spawner), yaml).unwrap();
    assert!(matches!(report, RunReport::Succeeded { .. }));
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello");

    let runs = dir.path().join("RUNS");
    let doc = evidence::load_evidence(&runs, "T1").unwrap().unwrap();
    assert_eq!(doc.steps.len(), 1);
    assert_eq!(doc.steps[0].status, StepStatus::Success);
    let status = evidence::load_status(&runs, "T1").unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.plan_fingerprint, doc.plan_fingerprint);
    assert_eq!(status.plan_fingerprint, report.plan().plan_fingerprint);
    assert_eq!(lock_files(dir.path()), 0);
    assert!(spawner.calls().is_empty());
}

#[test]
fn missing_secret_aborts_with_only_an_aborted_record() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T2
secrets_required: [MISSING_VAR]
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {file_path: out.txt, content: hello}
"#;
    let err = execute(&executor(dir.path(), &spawner), yaml).unwrap_err();
    match &err {
        EngineError::Security { source, .. } => {
            assert_eq!(source, &SecurityError::MissingSecret("MISSING_VAR".into()))
        }
        other => panic!("expected security error, got {other:?}"),
    }
    assert!(err.to_string().contains("MISSING_VAR"));
    assert_eq!(err.exit_code(), 2);

    assert!(!dir.path().join("out.txt").exists());
    let run_dir = dir.path().join("RUNS/T2");
    let names: Vec<String> = std::fs::read_dir(&run_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["status.json"]);
    let status = evidence::load_status(&dir.path().join("RUNS"), "T2").unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Aborted);
    assert!(status.reason.unwrap().starts_with("aborted:"));
}

#[test]
fn secret_present_in_host_env_passes_but_is_not_forwarded() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let exec = ContractExecutor::new(dir.path(), Config::default())
        .with_host_env(host_env(&[
            ("PATH", "/usr/bin"),
            ("HOME", "/home/ci"),
            ("API_TOKEN", "s3cret"),
        ]))
        .with_spawner(spawner.clone())
        .with_port_probe(FreePorts);
    let yaml = r#"
task_id: T3
secrets_required: [API_TOKEN]
commands:
  - id: "01"
    exec: {cmd: git, args: [status]}
"#;
    execute(&exec, yaml).unwrap();
    let calls = spawner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "git");
    assert_eq!(calls[0].args, ["status"]);
    assert!(!calls[0].env.contains_key("API_TOKEN"));
    assert_eq!(calls[0].env.get("HOME").map(String::as_str), Some("/home/ci"));
}

#[test]
fn disallowed_command_anywhere_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T4
commands:
  - id: "01"
    exec: {cmd: git, args: [status]}
  - id: "02"
    exec:
      cmd: write_file
      args: {file_path: a.txt, content: a}
  - id: "03"
    exec: {cmd: rm, args: [a.txt]}
"#;
    let err = execute(&executor(dir.path(), &spawner), yaml).unwrap_err();
    match &err {
        EngineError::Security {
            step_id, source, ..
        } => {
            assert_eq!(step_id.as_deref(), Some("03"));
            assert_eq!(source, &SecurityError::CommandNotAllowed("rm".into()));
        }
        other => panic!("expected security error, got {other:?}"),
    }
    assert!(spawner.calls().is_empty());
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(lock_files(dir.path()), 0);
}

#[test]
fn dangerous_arguments_abort_before_any_step() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T5
commands:
  - id: "01"
    exec: {cmd: git, args: [reset, --hard, origin/main]}
"#;
    let err = execute(&executor(dir.path(), &spawner), yaml).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Security {
            source: SecurityError::DangerousPattern { .. },
            ..
        }
    ));
    assert!(spawner.calls().is_empty());
}

#[test]
fn bound_port_aborts_before_locks() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let yaml = format!(
        r#"
task_id: T6
ports_should_be_free: [{port}]
evidence: [out.txt]
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {{file_path: out.txt, content: hello}}
"#
    );
    // Real TCP probe on purpose.
    let exec = ContractExecutor::new(dir.path(), Config::default()).with_host_env(BTreeMap::new());
    let err = execute(&exec, &yaml).unwrap_err();
    assert!(err.to_string().contains(&format!("port already in use: {port}")));
    assert_eq!(lock_files(dir.path()), 0);
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn third_of_five_failing_keeps_two_completed_records() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r##"
task_id: T7
evidence: [report.md]
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {file_path: report.md, content: "# draft"}
  - id: "02"
    exec: {cmd: pytest, args: [tests/, -q]}
  - id: "03"
    exec: {cmd: pytest, args: [tests/, fail]}
  - id: "04"
    exec:
      cmd: replace
      args: {file_path: report.md, old_string: draft, new_string: final}
  - id: "05"
    exec: {cmd: git, args: [add, report.md]}
"##;
    let exec = executor(dir.path(), &spawner);
    let err = execute(&exec, yaml).unwrap_err();
    match &err {
        EngineError::Execution {
            step_id,
            exit_code,
            stderr,
            ..
        } => {
            assert_eq!(step_id, "03");
            assert_eq!(*exit_code, Some(1));
            assert!(stderr.contains("AssertionError"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);

    let runs = dir.path().join("RUNS");
    let doc = evidence::load_evidence(&runs, "T7").unwrap().unwrap();
    assert_eq!(doc.completed_steps(), 2);
    let ids: Vec<_> = doc.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["01", "02", "03"]);
    assert_eq!(doc.steps[2].status, StepStatus::Failed);
    assert_eq!(doc.steps[2].exit_code, Some(1));

    let status = evidence::load_status(&runs, "T7").unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Failed);
    assert_eq!(status.failed_step.as_deref(), Some("03"));
    assert_eq!(status.steps_completed, 2);
    assert_eq!(status.steps_total, 5);

    // Steps 04 and 05 never ran.
    assert_eq!(spawner.calls().len(), 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("report.md")).unwrap(),
        "# draft"
    );

    // Every lock was released.
    assert_eq!(lock_files(dir.path()), 0);
    assert!(exec.lock_manager().acquire("report.md", LockWait::Fail).is_ok());
}

#[test]
fn rerun_replaces_previous_evidence() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let exec = executor(dir.path(), &spawner);
    let failing = r#"
task_id: T8
commands:
  - id: "01"
    exec: {cmd: npm, args: [test, fail]}
"#;
    let passing = r#"
task_id: T8
commands:
  - id: "01"
    exec: {cmd: npm, args: [test]}
"#;
    assert!(execute(&exec, failing).is_err());
    let first = evidence::load_evidence(&dir.path().join("RUNS"), "T8").unwrap().unwrap();

    execute(&exec, passing).unwrap();
    let second = evidence::load_evidence(&dir.path().join("RUNS"), "T8").unwrap().unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.plan_fingerprint, second.plan_fingerprint);
    assert_eq!(second.steps.len(), 1);
    let status = evidence::load_status(&dir.path().join("RUNS"), "T8").unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.run_id, Some(second.run_id));
}

#[test]
fn sequential_writes_and_absent_replace() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T9
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {file_path: notes/out.txt, content: "first line that is long"}
  - id: "02"
    exec:
      cmd: write_file
      args: {file_path: notes/out.txt, content: second}
  - id: "03"
    exec:
      cmd: replace
      args: {file_path: notes/out.txt, old_string: missing, new_string: x}
"#;
    execute(&executor(dir.path(), &spawner), yaml).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/out.txt")).unwrap(),
        "second"
    );
    let doc = evidence::load_evidence(&dir.path().join("RUNS"), "T9").unwrap().unwrap();
    assert!(doc.steps[2].result.as_deref().unwrap().contains("unchanged"));
}

#[test]
fn sequence_args_to_internal_step_fail_validation_before_anything() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let yaml = r#"
task_id: T10
commands:
  - id: "01"
    exec: {cmd: write_file, args: [out.txt, hello]}
"#;
    let err = execute(&executor(dir.path(), &spawner), yaml).unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(err.exit_code(), 5);
    assert!(!dir.path().join("RUNS").exists());
    assert!(!dir.path().join(".devrules").exists());
}

#[test]
fn truncates_long_output_in_evidence() {
    #[derive(Clone)]
    struct Chatty;
    impl ProcessSpawner for Chatty {
        fn spawn(&self, _request: &SpawnRequest<'_>) -> io::Result<ProcessOutput> {
            Ok(ProcessOutput {
                exit_code: 0,
                stdout: "x".repeat(50) + "END",
                stderr: String::new(),
            })
        }
    }
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_output_chars: 10,
        ..Config::default()
    };
    let exec = ContractExecutor::new(dir.path(), config)
        .with_host_env(BTreeMap::new())
        .with_spawner(Chatty)
        .with_port_probe(FreePorts);
    let yaml = "task_id: T11\ncommands:\n  - id: a\n    exec: {cmd: node, args: [build.js]}\n";
    execute(&exec, yaml).unwrap();
    let doc = evidence::load_evidence(&dir.path().join("RUNS"), "T11").unwrap().unwrap();
    assert!(doc.steps[0].stdout.ends_with("xxxxxxxEND"));
    assert!(doc.steps[0].stdout.starts_with("[truncated 43 chars]"));
}

#[test]
fn runs_with_disjoint_targets_proceed_in_parallel() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|name| {
            let root = root.clone();
            std::thread::spawn(move || {
                let exec = ContractExecutor::new(&root, Config::default())
                    .with_host_env(BTreeMap::new())
                    .with_port_probe(FreePorts);
                let yaml = format!(
                    r#"
task_id: P{name}
commands:
  - id: w
    exec: {{cmd: write_file, args: {{file_path: {name}.txt, content: {name}}}}}
"#
                );
                execute(&exec, &yaml).is_ok()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(std::fs::read_to_string(root.join("A.txt")).unwrap(), "A");
    assert_eq!(std::fs::read_to_string(root.join("B.txt")).unwrap(), "B");
}

#[test]
fn blocked_run_waits_for_the_holder() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let holder = ContractExecutor::new(&root, Config::default());
    let held = holder
        .lock_manager()
        .acquire("shared.txt", LockWait::Fail)
        .unwrap();

    let waiter = {
        let root = root.clone();
        std::thread::spawn(move || {
            let exec = ContractExecutor::new(&root, Config::default())
                .with_host_env(BTreeMap::new())
                .with_port_probe(FreePorts);
            let yaml = r#"
task_id: W
commands:
  - id: w
    exec: {cmd: write_file, args: {file_path: shared.txt, content: waited}}
"#;
            execute(&exec, yaml).is_ok()
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(150));
    assert!(!root.join("shared.txt").exists());
    drop(held);
    assert!(waiter.join().unwrap());
    assert_eq!(std::fs::read_to_string(root.join("shared.txt")).unwrap(), "waited");
}

#[test]
fn other_spellings_of_a_locked_path_are_refused() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let exec = executor(dir.path(), &spawner);
    let _held = exec.lock_manager().acquire("out.txt", LockWait::Fail).unwrap();
    let options = RunOptions {
        lock_wait: Some(LockWait::Fail),
        ..RunOptions::default()
    };

    let absolute = dir.path().join("out.txt");
    for (task_id, spelling) in [
        ("A1", absolute.display().to_string()),
        ("A2", "sub/../out.txt".to_string()),
        ("A3", "./out.txt".to_string()),
    ] {
        let yaml = format!(
            r#"
task_id: {task_id}
commands:
  - id: "01"
    exec:
      cmd: write_file
      args: {{file_path: "{spelling}", content: clobbered}}
"#
        );
        let contract = Contract::from_yaml_str(&yaml).unwrap();
        let plan = exec.plan(&contract).unwrap();
        assert_eq!(plan.lock_targets, ["out.txt"], "spelling: {spelling}");
        let err = exec.execute(&contract, &options).unwrap_err();
        assert!(
            matches!(err, EngineError::LockHeld { .. }),
            "spelling {spelling}: {err}"
        );
    }
    assert!(!absolute.exists());
}

#[test]
fn abort_does_not_touch_evidence_of_a_run_in_progress() {
    let dir = TempDir::new().unwrap();
    let spawner = RecordingSpawner::default();
    let exec = executor(dir.path(), &spawner);
    let runs = dir.path().join("RUNS");
    std::fs::create_dir_all(runs.join("T1")).unwrap();
    std::fs::write(runs.join("T1/evidence.json"), "{}").unwrap();
    let _running = exec
        .lock_manager()
        .acquire(&exec.run_lock_target("T1"), LockWait::Fail)
        .unwrap();

    let yaml = r#"
task_id: T1
secrets_required: [MISSING_VAR]
commands:
  - id: "01"
    exec: {cmd: write_file, args: {file_path: out.txt, content: hello}}
"#;
    let err = execute(&exec, yaml).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(std::fs::read_to_string(runs.join("T1/evidence.json")).unwrap(), "{}");
    assert!(!runs.join("T1/status.json").exists());
}

#[test]
fn runs_of_one_task_take_turns() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let handles: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let root = root.clone();
            std::thread::spawn(move || {
                let exec = ContractExecutor::new(&root, Config::default())
                    .with_host_env(BTreeMap::new())
                    .with_port_probe(FreePorts);
                let yaml = format!(
                    r#"
task_id: SAME
commands:
  - id: a
    exec: {{cmd: write_file, args: {{file_path: {name}-a.txt, content: {name}}}}}
  - id: b
    exec: {{cmd: write_file, args: {{file_path: {name}-b.txt, content: {name}}}}}
"#
                );
                execute(&exec, &yaml).is_ok()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    let runs = root.join("RUNS");
    let doc = evidence::load_evidence(&runs, "SAME").unwrap().unwrap();
    let status = evidence::load_status(&runs, "SAME").unwrap().unwrap();
    assert_eq!(doc.steps.len(), 2);
    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.run_id, Some(doc.run_id));
    assert_eq!(lock_files(&root), 0);
}
