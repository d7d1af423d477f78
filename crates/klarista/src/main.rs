use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use klarista::commands::{self, Context, create::CreateOptions};
use klarista::sync::UploadOutcome;
use klarista::{Error, Result};

#[derive(Debug, Parser)]
#[command(
    name = "klarista",
    author,
    version,
    about = "Provision kops clusters with terraform and keep their working state in S3"
)]
struct Args {
    /// Path to a klarista.toml (defaults to ./klarista.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path(s) to the cluster input file(s)
    #[arg(short = 'i', long = "input", global = true)]
    inputs: Vec<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new cluster, or apply changes to an existing one
    Create {
        name: String,
        /// Apply updates as quickly as possible. This is not safe in production
        #[arg(long)]
        fast: bool,
        /// Skip confirmation
        #[arg(long)]
        yes: bool,
        /// Path to the klarista output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Destroy an existing cluster
    Destroy {
        name: String,
        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Get a file from the cluster state
    Get {
        name: String,
        #[arg(value_name = "PATH")]
        file: String,
        /// Return file path rather than content
        #[arg(long = "path")]
        path_only: bool,
    },
    /// Manage klarista state
    State {
        #[command(subcommand)]
        cmd: StateCommand,
    },
    /// Print the cluster environment
    Env { name: String },
}

#[derive(Debug, Subcommand)]
enum StateCommand {
    /// Push local klarista state to remote
    Push { name: String },
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();
    klarista::shell::install_signal_handlers();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

// KLARISTA_LOG / RUST_LOG win; otherwise DEBUG=klarista turns on debug output.
fn init_logging() {
    let debug = std::env::var("DEBUG")
        .map(|v| v.contains("klarista"))
        .unwrap_or(false);
    let filter = tracing_subscriber::EnvFilter::try_from_env("KLARISTA_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if debug { "klarista=debug" } else { "klarista=info" })
        });
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true)
        .without_time()
        .with_file(debug)
        .with_line_number(debug)
        .init();
}

fn run(args: Args) -> Result<()> {
    let cfg = klarista::config::load(args.config.as_deref())?;
    let cwd = std::env::current_dir()
        .map_err(|e| Error::io(format!("failed to read current directory: {e}")))?;
    let ctx = Context::new(cfg, args.inputs, cwd);

    match args.cmd {
        Command::Create {
            name,
            fast,
            yes,
            out,
        } => commands::create::run(&ctx, &name, &CreateOptions { fast, yes, out }),
        Command::Destroy { name, yes } => commands::destroy::run(&ctx, &name, yes),
        Command::Get {
            name,
            file,
            path_only,
        } => emit(&commands::get::run(&ctx, &name, &file, path_only)?),
        Command::State {
            cmd: StateCommand::Push { name },
        } => {
            match commands::push::run(&ctx, &name)? {
                UploadOutcome::Stored { location } => {
                    tracing::info!("pushed state for {name} to {location}")
                }
                UploadOutcome::Dropped => tracing::warn!("state for {name} was not pushed"),
            }
            Ok(())
        }
        Command::Env { name } => emit(&commands::env::run(&ctx, &name)?),
    }
}

fn emit(s: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(s.as_bytes())?;
    out.flush()?;
    Ok(())
}
