use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(version, about = "Keystone backup and license-cache subsystem CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, verify, restore, list, and retain backups
    Backup(commands::backup::BackupArgs),

    /// Sync, validate, and inspect the per-tenant license cache
    License(commands::license::LicenseArgs),

    /// Run the scheduler: backups, verification, retention, and license sync
    Serve(commands::serve::ServeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keystone={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Backup(args) => commands::backup::execute(args).await,
        Commands::License(args) => commands::license::execute(args).await,
        Commands::Serve(args) => commands::serve::execute(args).await,
    }
}
