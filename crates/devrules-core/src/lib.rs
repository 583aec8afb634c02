//! Contract execution engine.
//!
//! A contract is a YAML document naming an ordered list of steps plus the
//! preconditions under which they may run. [`executor::ContractExecutor`]
//! validates it, evaluates the security gates, locks every file it will
//! mutate, runs the steps in order, and records JSON evidence of what
//! happened under `RUNS/<task_id>/`.

pub mod config;
pub mod contract;
pub mod env;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod external;
pub mod gate;
pub mod hasher;
pub mod internal;
pub mod io;
pub mod lock;
pub mod paths;

pub use contract::{Contract, Step, StepKind};
pub use error::{EngineError, Result, SecurityError};
pub use executor::{ContractExecutor, ExecutionMode, Plan, RunOptions, RunReport};
