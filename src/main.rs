use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use weft::commands::{completions, run, status};
use weft::commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Run a coding agent in a loop with usage-aware pausing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent on a task until it finishes or stalls
    Run(RunArgs),

    /// Show recent iteration records
    Status {
        /// Workspace directory to inspect
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// How many records to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run::execute(args),
        Commands::Status { workspace, limit } => status::execute(workspace, limit),
        Commands::Completions { shell } => {
            completions::execute(shell, &mut Cli::command());
            Ok(())
        }
    }
}
