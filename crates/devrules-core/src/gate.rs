//! Security gates evaluated before anything is mutated.
//!
//! Contract-level gates (secrets, ports) run once per run. Step-level gates
//! (allowlist, dangerous patterns) run for every external step, both during
//! pre-flight and again at dispatch.

use crate::error::SecurityError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::OnceLock;
use std::time::Duration;

/// Commands an external step may name.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["python", "python3", "git", "pytest", "node", "npm"];

pub type GateResult = std::result::Result<GateCheck, SecurityError>;

// ---------------------------------------------------------------------------
// GateKind / GateCheck
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Secrets,
    Ports,
    Allowlist,
    DangerousPattern,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Secrets => "secrets",
            GateKind::Ports => "ports",
            GateKind::Allowlist => "allowlist",
            GateKind::DangerousPattern => "dangerous-pattern",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SecurityError {
    pub fn gate(&self) -> GateKind {
        match self {
            SecurityError::MissingSecret(_) => GateKind::Secrets,
            SecurityError::PortInUse(_) => GateKind::Ports,
            SecurityError::CommandNotAllowed(_) => GateKind::Allowlist,
            SecurityError::DangerousPattern { .. } => GateKind::DangerousPattern,
        }
    }
}

/// A gate that passed, with what it checked. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    pub gate: GateKind,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Secrets gate
// ---------------------------------------------------------------------------

/// Every name in `required` must be set and non-empty in `host`. Fails on the
/// first missing name, in contract order.
pub fn check_secrets(required: &[String], host: &BTreeMap<String, String>) -> GateResult {
    for name in required {
        let present = host.get(name).is_some_and(|v| !v.is_empty());
        tracing::debug!(secret = %name, present, "secrets gate");
        if !present {
            return Err(SecurityError::MissingSecret(name.clone()));
        }
    }
    Ok(GateCheck {
        gate: GateKind::Secrets,
        detail: format!("{} secret(s) present", required.len()),
    })
}

// ---------------------------------------------------------------------------
// Ports gate
// ---------------------------------------------------------------------------

pub trait PortProbe {
    /// True when something is already accepting connections on `port`.
    fn is_bound(&self, port: u16) -> bool;
}

/// Probes by connecting to `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    pub timeout: Duration,
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
        }
    }
}

impl PortProbe for TcpPortProbe {
    fn is_bound(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

pub fn check_ports(ports: &[u16], probe: &dyn PortProbe) -> GateResult {
    for &port in ports {
        let bound = probe.is_bound(port);
        tracing::debug!(port, bound, "ports gate");
        if bound {
            return Err(SecurityError::PortInUse(port));
        }
    }
    Ok(GateCheck {
        gate: GateKind::Ports,
        detail: format!("{} port(s) free", ports.len()),
    })
}

// ---------------------------------------------------------------------------
// Step gates
// ---------------------------------------------------------------------------

struct DangerPattern {
    label: &'static str,
    re: Regex,
}

static DANGER_PATTERNS: OnceLock<Vec<DangerPattern>> = OnceLock::new();
static SHELL_META_RE: OnceLock<Regex> = OnceLock::new();
static PRIVILEGE_RE: OnceLock<Regex> = OnceLock::new();

fn danger_patterns() -> &'static [DangerPattern] {
    DANGER_PATTERNS.get_or_init(|| {
        [
            ("recursive delete", r"(?i)\brm\s+(-\w+\s+)*-\w*[rf]"),
            ("recursive delete", r"--no-preserve-root"),
            ("recursive delete", r"(?i)\b(rmdir|rd)\s+/s\b"),
            ("recursive delete", r"(?i)\bdel\s+/[fsq]\b"),
            ("permission change", r"\bchmod\s+(-R\s+)?0?777\b"),
            ("permission change", r"\bchown\s+-R\b"),
            ("disk write", r"\bmkfs(\.\w+)?\b"),
            ("disk write", r"\bdd\s+if="),
            ("disk write", r">\s*/dev/(sd|hd|nvme|disk)"),
            ("disk write", r"(?i)\bformat\s+[a-z]:"),
            ("fork bomb", r":\(\)\s*\{"),
            ("history rewrite", r"\bpush\s+(.*\s)?(--force|-f)(\s|$)"),
            ("history rewrite", r"\breset\s+--hard\b"),
            ("history rewrite", r"\bclean\s+-\w*f"),
        ]
        .into_iter()
        .map(|(label, pattern)| DangerPattern {
            label,
            re: Regex::new(pattern).expect("danger pattern is valid"),
        })
        .collect()
    })
}

fn shell_meta_re() -> &'static Regex {
    SHELL_META_RE.get_or_init(|| {
        Regex::new(r"[;|`]|&&|\$\(|\$\{|<\(").expect("shell metacharacter pattern is valid")
    })
}

fn privilege_re() -> &'static Regex {
    PRIVILEGE_RE.get_or_init(|| {
        Regex::new(r"(?i)(^|\s)(sudo|doas|su|pkexec|runas)(\s|$)")
            .expect("privilege pattern is valid")
    })
}

/// A privilege tool only counts in command position: as the first argument
/// or inside an argument that holds a whole command line. `git checkout su`
/// names a branch.
fn escalates_privilege(args: &[String]) -> bool {
    args.iter().enumerate().any(|(i, arg)| {
        let command_line = i == 0 || arg.trim().contains(char::is_whitespace);
        command_line && privilege_re().is_match(arg.trim())
    })
}

/// Static command allowlist plus dangerous-pattern scanner for external steps.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed: BTreeSet<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SecurityPolicy {
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policy = Self::default();
        policy.allowed.extend(extra.into_iter().map(Into::into));
        policy
    }

    pub fn allowed_commands(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// The literal command name must be on the allowlist. Paths such as
    /// `/bin/git` are not the same name as `git`.
    pub fn check_command(&self, cmd: &str) -> GateResult {
        if !self.allowed.contains(cmd) {
            return Err(SecurityError::CommandNotAllowed(cmd.to_string()));
        }
        Ok(GateCheck {
            gate: GateKind::Allowlist,
            detail: format!("{cmd} allowed"),
        })
    }

    /// Scan the rendered argument string for destructive operations, each
    /// single argument for shell metacharacters, and command positions for
    /// privilege escalation.
    pub fn check_args(&self, args: &[String]) -> GateResult {
        let rendered = args.join(" ");
        if let Some(hit) = danger_patterns().iter().find(|p| p.re.is_match(&rendered)) {
            return Err(SecurityError::DangerousPattern {
                pattern: hit.label.to_string(),
            });
        }
        if escalates_privilege(args) {
            return Err(SecurityError::DangerousPattern {
                pattern: "privilege escalation".to_string(),
            });
        }
        if args.iter().any(|arg| shell_meta_re().is_match(arg)) {
            return Err(SecurityError::DangerousPattern {
                pattern: "shell metacharacter".to_string(),
            });
        }
        Ok(GateCheck {
            gate: GateKind::DangerousPattern,
            detail: format!("{} argument(s) clean", args.len()),
        })
    }

    /// Both step-level gates, allowlist first.
    pub fn check_step(
        &self,
        cmd: &str,
        args: &[String],
    ) -> std::result::Result<Vec<GateCheck>, SecurityError> {
        Ok(vec![self.check_command(cmd)?, self.check_args(args)?])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
