use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use devrules_core::config::Config;
use devrules_core::evidence::{self, ChecksumState};
use devrules_core::EngineError;
use std::path::Path;

#[derive(Subcommand)]
pub enum EvidenceSubcommand {
    /// Show the recorded status and step records of a task
    Show { task_id: String },
    /// Re-hash recorded evidence files and report drift
    Verify { task_id: String },
}

pub fn run(root: &Path, subcmd: EvidenceSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let runs_dir = config.runs_dir(root);
    match subcmd {
        EvidenceSubcommand::Show { task_id } => show(&runs_dir, &task_id, json),
        EvidenceSubcommand::Verify { task_id } => verify(root, &runs_dir, &task_id, json),
    }
}

fn show(runs_dir: &Path, task_id: &str, json: bool) -> anyhow::Result<()> {
    let status = evidence::load_status(runs_dir, task_id)?;
    let doc = evidence::load_evidence(runs_dir, task_id)?;
    if status.is_none() && doc.is_none() {
        return Err(EngineError::EvidenceNotFound(task_id.to_string()).into());
    }

    if json {
        return print_json(&serde_json::json!({
            "status": status,
            "evidence": doc,
        }));
    }

    match &status {
        Some(status) => {
            println!("Task: {}  status: {}", status.task_id, status.status);
            println!("Fingerprint: {}", status.plan_fingerprint);
            println!(
                "Steps: {}/{} completed",
                status.steps_completed, status.steps_total
            );
            if let Some(step) = &status.failed_step {
                println!("Failed step: {step}");
            }
            if let Some(reason) = &status.reason {
                println!("Reason: {reason}");
            }
        }
        None => println!("Task: {task_id}  status: running"),
    }

    if let Some(doc) = &doc {
        println!();
        let rows = doc
            .steps
            .iter()
            .map(|s| {
                vec![
                    s.id.clone(),
                    s.status.as_str().to_string(),
                    s.kind.as_str().to_string(),
                    s.exit_code.map(|c| c.to_string()).unwrap_or_default(),
                    format!("{}ms", s.duration_ms),
                    s.command.clone(),
                ]
            })
            .collect();
        print_table(&["ID", "STATUS", "KIND", "EXIT", "TIME", "COMMAND"], rows);
    }
    Ok(())
}

fn verify(root: &Path, runs_dir: &Path, task_id: &str, json: bool) -> anyhow::Result<()> {
    let checks = evidence::verify(root, runs_dir, task_id)?;
    if json {
        print_json(&checks)?;
    } else if checks.is_empty() {
        println!("No evidence checksums recorded for '{task_id}'.");
    } else {
        let rows = checks
            .iter()
            .map(|c| vec![c.state.as_str().to_string(), c.path.clone()])
            .collect();
        print_table(&["STATE", "PATH"], rows);
    }

    let drifted = checks
        .iter()
        .filter(|c| c.state != ChecksumState::Ok)
        .count();
    if drifted > 0 {
        anyhow::bail!("{drifted} evidence file(s) changed since the run");
    }
    Ok(())
}
