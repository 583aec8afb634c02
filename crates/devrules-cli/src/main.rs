mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{evidence::EvidenceSubcommand, run::ModeArg};
use devrules_core::EngineError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "devrules",
    about = "Run task contracts behind security gates, file locks, and an evidence trail",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .devrules/ or .git/)
    #[arg(long, global = true, env = "DEVRULES_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log run progress (info level)
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a contract
    Run {
        /// Path to the contract YAML
        contract: PathBuf,

        #[arg(long, value_enum, default_value_t = ModeArg::Execute)]
        mode: ModeArg,

        /// Accept the plan without prompting (confirm mode)
        #[arg(long, short = 'y')]
        yes: bool,

        /// Refuse to run unless the plan fingerprint equals this value
        #[arg(long = "approved-plan", value_name = "FINGERPRINT")]
        approved_plan: Option<String>,

        /// Fail instead of waiting when a target file is locked
        #[arg(long)]
        no_wait: bool,
    },

    /// Evaluate gates and print the plan without changing anything
    Plan { contract: PathBuf },

    /// Print the plan fingerprint of a contract
    Fingerprint { contract: PathBuf },

    /// Print SHA-256 checksums of files
    Checksum {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Inspect recorded runs
    Evidence {
        #[command(subcommand)]
        subcommand: EvidenceSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Run {
            contract,
            mode,
            yes,
            approved_plan,
            no_wait,
        } => cmd::run::run(
            &root,
            &contract,
            cmd::run::RunArgs {
                mode,
                yes,
                approved_plan,
                no_wait,
            },
            cli.json,
        ),
        Commands::Plan { contract } => cmd::run::plan(&root, &contract, cli.json),
        Commands::Fingerprint { contract } => cmd::hash::fingerprint(&contract, cli.json),
        Commands::Checksum { files } => cmd::hash::checksum(&files, cli.json),
        Commands::Evidence { subcommand } => cmd::evidence::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<EngineError>()
            .map(EngineError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
