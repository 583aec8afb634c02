pub mod evidence;
pub mod hash;
pub mod run;

use anyhow::Context;
use devrules_core::Contract;
use std::path::Path;

pub(crate) fn load_contract(path: &Path) -> anyhow::Result<Contract> {
    Contract::load(path).with_context(|| format!("failed to load contract {}", path.display()))
}
