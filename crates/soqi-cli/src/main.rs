use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "soqi-cli")]
#[command(about = "Stack Overflow question indexer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync from the question API into the index.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = soqi_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} watermark={} fetched={} indexed={}",
                summary.run_id,
                summary
                    .watermark
                    .map(|w| w.to_rfc3339())
                    .unwrap_or_else(|| "none".to_string()),
                summary.fetched,
                summary.indexed
            );
        }
    }

    Ok(())
}
