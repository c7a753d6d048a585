use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ksync_core::RequiredFields;
use ksync_sync::{ConnectorConfig, SyncConfig};
use tracing::level_filters::LevelFilter;
use tracing::subscriber::set_global_default;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ksync-cli")]
#[command(about = "Save scraped connector entries and their files exactly once")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Connector YAML configuration
    #[arg(long)]
    config: PathBuf,

    /// JSON array of fetched entries
    #[arg(long)]
    entries: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drop already-saved entries, then save files and records for the rest
    Sync {
        #[command(flatten)]
        input: InputArgs,

        /// Destination folder for downloaded files
        #[arg(long)]
        folder: String,
    },
    /// Update matching records and create the others
    Reconcile {
        #[command(flatten)]
        input: InputArgs,
    },
}

/// `RUST_LOG` decides when no `-v` is given; `-v` flags override it.
fn log_filter(verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => {
            return EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        }
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    EnvFilter::from_default_env().add_directive(level.into())
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    set_global_default(subscriber).context("installing the tracing subscriber")
}

fn load_input(input: &InputArgs) -> Result<(ConnectorConfig, Vec<ksync_core::Entry>)> {
    let connector = ConnectorConfig::from_yaml_file(&input.config)?;
    let entries = ksync_sync::load_entries(&input.entries)?;
    Ok((connector, entries))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let settings = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { input, folder } => {
            let (connector, entries) = load_input(&input)?;
            let (summary, report) =
                ksync_sync::run_sync_once(&settings, &connector, RequiredFields::new(folder), entries)
                    .await
                    .context("sync run failed")?;
            println!(
                "sync complete: run_id={} created={} skipped={} failed={} files_created={} files_repaired={} files_replaced={} deferred={} report={}",
                summary.run_id,
                summary.stats.created_total(),
                summary.stats.skipped + summary.stats.duplicates,
                summary.stats.failed,
                summary.stats.files_created,
                summary.stats.files_repaired,
                summary.stats.files_replaced,
                summary.stats.deferred,
                report.display()
            );
        }
        Commands::Reconcile { input } => {
            let (connector, entries) = load_input(&input)?;
            let (summary, report) = ksync_sync::run_reconcile_once(&settings, &connector, entries)
                .await
                .context("reconcile run failed")?;
            println!(
                "reconcile complete: run_id={} created={} updated={} failed={} report={}",
                summary.run_id,
                summary.stats.created_total(),
                summary.stats.updated_total(),
                summary.stats.failed,
                report.display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flags_set_the_level() {
        assert_eq!(log_filter(3).max_level_hint(), Some(LevelFilter::TRACE));
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(log_filter(1).max_level_hint(), Some(LevelFilter::INFO));
        }
    }

    #[test]
    fn quiet_runs_default_to_warnings() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(log_filter(0).max_level_hint(), Some(LevelFilter::WARN));
        }
    }
}
