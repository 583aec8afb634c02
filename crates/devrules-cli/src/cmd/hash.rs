use crate::output::print_json;
use anyhow::Context;
use devrules_core::hasher;
use std::path::{Path, PathBuf};

pub fn fingerprint(contract: &Path, json: bool) -> anyhow::Result<()> {
    let contract = super::load_contract(contract)?;
    let fingerprint = hasher::plan_fingerprint(&contract)?;
    if json {
        print_json(&serde_json::json!({
            "task_id": contract.task_id,
            "plan_fingerprint": fingerprint,
        }))?;
    } else {
        println!("{fingerprint}");
    }
    Ok(())
}

pub fn checksum(files: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut digests = Vec::with_capacity(files.len());
    for file in files {
        let digest = hasher::file_checksum(file)
            .with_context(|| format!("failed to hash {}", file.display()))?;
        digests.push((file.display().to_string(), digest));
    }

    if json {
        let entries: Vec<_> = digests
            .iter()
            .map(|(path, sha256)| serde_json::json!({ "path": path, "sha256": sha256 }))
            .collect();
        print_json(&entries)?;
    } else {
        for (path, digest) in &digests {
            println!("{digest}  {path}");
        }
    }
    Ok(())
}
