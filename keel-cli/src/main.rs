//! `keel-migrate` - applies, rolls back and inspects schema migrations.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "keel-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database to migrate
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://keel.db", global = true)]
    database_url: String,

    /// Directory holding the migration files
    #[arg(short, long, env = "KEEL_MIGRATIONS_DIR", default_value = "migrations", global = true)]
    migrations_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations
    Up {
        /// Apply at most this many migrations (all if omitted)
        steps: Option<NonZeroUsize>,
    },

    /// Roll back applied migrations, newest first
    Down {
        /// Number of migrations to roll back
        #[arg(default_value_t = 1)]
        steps: usize,
    },

    /// Show which migrations are applied or pending
    Status,

    /// Create a new, empty migration file
    Create {
        /// Name of the migration (e.g., "create_pages")
        name: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    // A missing .env file is fine; the environment and flags still apply.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let all_ok = commands::execute(cli).await?;
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
