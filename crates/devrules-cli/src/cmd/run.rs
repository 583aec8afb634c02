use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::ValueEnum;
use devrules_core::config::LockWait;
use devrules_core::executor::Confirm;
use devrules_core::{paths, ContractExecutor, ExecutionMode, Plan, RunOptions, RunReport};
use std::io::{BufRead, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Plan,
    Confirm,
    Execute,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Plan => ExecutionMode::Plan,
            ModeArg::Confirm => ExecutionMode::Confirm,
            ModeArg::Execute => ExecutionMode::Execute,
        }
    }
}

pub struct RunArgs {
    pub mode: ModeArg,
    pub yes: bool,
    pub approved_plan: Option<String>,
    pub no_wait: bool,
}

/// Asks on the terminal. Anything but `y`/`yes` declines, including EOF.
struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn confirm(&self, plan: &Plan) -> bool {
        print_plan(plan);
        eprint!("Proceed? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

pub fn run(root: &Path, contract: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let contract = super::load_contract(contract)?;
    let mut executor = ContractExecutor::from_root(root).context("failed to load config")?;
    if args.yes {
        executor = executor.with_confirmer(|_: &Plan| true);
    } else if !json {
        executor = executor.with_confirmer(PromptConfirm);
    }

    let options = RunOptions {
        mode: args.mode.into(),
        approved_fingerprint: args.approved_plan,
        lock_wait: args.no_wait.then_some(LockWait::Fail),
    };
    let report = executor.execute(&contract, &options)?;

    match report {
        RunReport::Planned(plan) => {
            if json {
                print_json(&plan)?;
            } else {
                print_plan(&plan);
            }
        }
        RunReport::Succeeded { plan, status } => {
            if json {
                print_json(&status)?;
            } else {
                println!(
                    "Run succeeded: {} ({}/{} steps)",
                    plan.task_id, status.steps_completed, status.steps_total
                );
                println!("Fingerprint: {}", plan.plan_fingerprint);
                let evidence = paths::evidence_path(&executor.runs_dir(), &plan.task_id);
                println!("Evidence: {}", evidence.display());
            }
        }
    }
    Ok(())
}

pub fn plan(root: &Path, contract: &Path, json: bool) -> anyhow::Result<()> {
    let contract = super::load_contract(contract)?;
    let executor = ContractExecutor::from_root(root).context("failed to load config")?;
    let plan = executor.plan(&contract)?;
    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    if plan.title.is_empty() {
        println!("Task: {}", plan.task_id);
    } else {
        println!("Task: {} ({})", plan.task_id, plan.title);
    }
    println!("Fingerprint: {}", plan.plan_fingerprint);
    for check in &plan.gates {
        println!("  [pass] {}: {}", check.gate, check.detail);
    }
    if !plan.lock_targets.is_empty() {
        println!("Locks: {}", plan.lock_targets.join(", "));
    }
    println!();

    let rows = plan
        .steps
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                s.kind.as_str().to_string(),
                s.summary.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "KIND", "COMMAND"], rows);
}
