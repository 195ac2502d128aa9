use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devapps_sync::{init_database, run_sync_once, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "devapps-cli")]
#[command(about = "Sync recent Brisbane development applications into SQLite")]
struct Cli {
    /// SQLite database file (overrides DEVAPPS_DATABASE_PATH).
    #[arg(long, global = true, env = "DEVAPPS_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the trailing window of applications and upsert them.
    Sync,
    /// Create the database and table without fetching.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once(config).await.context("sync run failed")?;
            println!("Finish writing data");
            println!(
                "Complete. run_id={} fetched={} unique={} saved={} date={}",
                summary.run_id, summary.fetched, summary.deduplicated, summary.persisted, summary.run_date
            );
        }
        Commands::InitDb => {
            init_database(&config)
                .await
                .with_context(|| format!("initializing {}", config.database_path.display()))?;
            println!("database ready at {}", config.database_path.display());
        }
    }

    Ok(())
}
