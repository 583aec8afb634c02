//! Child-process environment: only allowlisted host variables are passed on.

use std::collections::BTreeMap;
use std::ffi::OsString;

/// Variables every spawned step may see.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USERPROFILE",
    "SYSTEMROOT",
    "COMSPEC",
    "PATHEXT",
    "TEMP",
    "TMP",
    "TMPDIR",
    "LANG",
    "LC_ALL",
    "TERM",
    "PYTHONPATH",
    "PYTHONIOENCODING",
    "VIRTUAL_ENV",
    "NODE_ENV",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

/// Snapshot of the host environment, taken once per executor.
pub fn host_env() -> BTreeMap<String, String> {
    utf8_env(std::env::vars_os())
}

/// Keep the entries whose name and value are both valid UTF-8. Anything else
/// is skipped rather than forwarded mangled.
fn utf8_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                tracing::debug!(name = ?name, "skipping non-UTF-8 environment variable");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    allowlist: Vec<String>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvironmentBuilder {
    /// Built-in allowlist plus `extra` names.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = Self::default();
        for name in extra {
            let name = name.into();
            if !builder.allowlist.contains(&name) {
                builder.allowlist.push(name);
            }
        }
        builder
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    /// Filter `host` down to allowlisted names. Nothing outside the allowlist
    /// is ever copied.
    pub fn build(&self, host: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.allowlist
            .iter()
            .filter_map(|name| host.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}
