mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdr_restore::{check_dump, RestoreRunner, RestoreSummary};
use sdr_storage::{PgSiteStore, StoreConfig};

#[derive(Debug, Parser)]
#[command(name = "sdr-cli", version, about = "Reconciles site records against a log-formatted dump")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the dump on stdin against the site store
    Restore {
        /// Plan and narrate patches without writing them
        #[arg(long)]
        dry_run: bool,
        /// Override DATABASE_URL for the site store
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Parse the dump on stdin without touching the store
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command.unwrap_or(Commands::Restore {
        dry_run: false,
        database_url: None,
    }) {
        Commands::Restore {
            dry_run,
            database_url,
        } => {
            let mut config = StoreConfig::from_env();
            if let Some(url) = database_url {
                config.database_url = url;
            }
            let store = PgSiteStore::connect(&config)
                .await
                .context("connecting to site store")?;
            let summary = RestoreRunner::new(Arc::new(store))
                .dry_run(dry_run)
                .run(tokio::io::stdin())
                .await?;
            print_summary(&summary);
        }
        Commands::Check => {
            let summary = check_dump(tokio::io::stdin()).await?;
            println!("Dump check finished.");
            println!("  Lines seen:       {}", summary.lines_seen);
            println!("  Site records:     {}", summary.records_parsed);
            println!("  Invalid lines:    {}", summary.invalid_lines);
        }
    }

    Ok(())
}

fn print_summary(summary: &RestoreSummary) {
    let duration = summary.finished_at - summary.started_at;
    let suffix = if summary.dry_run { " (dry run)" } else { "" };
    println!("Restore run {} finished{}.", summary.run_id, suffix);
    println!("  Lines seen:       {}", summary.lines_seen);
    println!("  Site records:     {}", summary.records_matched);
    println!("  Updated:          {}", summary.updated);
    println!("  Unchanged:        {}", summary.unchanged);
    println!("  No source data:   {}", summary.no_source_data);
    println!("  Invalid lines:    {}", summary.invalid_lines);
    println!("  Lookup failures:  {}", summary.lookup_failures);
    println!("  Update failures:  {}", summary.update_failures);
    println!(
        "  Duration:         {:.2}s",
        duration.num_milliseconds() as f64 / 1000.0
    );
}
