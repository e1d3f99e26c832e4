// Administrative CLI.
//
// Exit codes: 0 success, 1 partial failure (e.g. a failed eval scenario),
// 2 invalid argument (also produced by clap itself on bad flags).

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

pub const EXIT_OK: i32 = 0;
pub const EXIT_PARTIAL_FAILURE: i32 = 1;
pub const EXIT_INVALID_ARGUMENT: i32 = 2;

#[derive(Parser)]
#[command(name = "perpetua", about = "Perpetua administrative commands", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete prompt archives older than the retention window
    PrunePromptArchives(commands::archives::PruneArgs),
    /// Dispatch eval runs and poll until all tasks reach a terminal state
    RunEvals(commands::evals::RunEvalsArgs),
    /// Run the soft-expiration sweeper
    SoftExpireAgents(commands::expire::SoftExpireArgs),
    /// Reconcile schedule entries with agent life-state
    SyncSchedules,
    /// First-run helper: ensure the superuser account exists (idempotent)
    CreateInitialSuperuser(commands::superuser::SuperuserArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_PARTIAL_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::PrunePromptArchives(args) => commands::archives::run(args).await,
        Command::RunEvals(args) => commands::evals::run(args).await,
        Command::SoftExpireAgents(args) => commands::expire::run(args).await,
        Command::SyncSchedules => commands::schedules::run().await,
        Command::CreateInitialSuperuser(args) => commands::superuser::run(args).await,
    }
}
