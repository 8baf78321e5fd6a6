//! `dira` command line entry point.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dira_core::Listing;
use dira_storage::CatalogStore;
use dira_sync::{SyncConfig, SyncPipeline, SyncReport};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dira", version, about = "Rental listing watcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync cycle across every enabled source.
    Sync {
        /// Source registry file (overrides DIRA_SOURCES_PATH).
        #[arg(long)]
        sources: Option<PathBuf>,
        /// Catalog file (overrides DIRA_CATALOG_PATH).
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Emit the full run report as JSON instead of the summary.
        #[arg(long)]
        json: bool,
    },
    /// Print catalog statistics.
    Catalog {
        /// Catalog file (overrides DIRA_CATALOG_PATH).
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Sync {
            sources,
            catalog,
            json,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(sources) = sources {
                config.sources_path = sources;
            }
            if let Some(catalog) = catalog {
                config.catalog_path = catalog;
            }
            let pipeline = SyncPipeline::new(config)?;
            let report = pipeline.run().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing report")?
                );
            } else {
                print_summary(&report);
            }
        }
        Command::Catalog { catalog } => {
            let mut config = SyncConfig::from_env();
            if let Some(catalog) = catalog {
                config.catalog_path = catalog;
            }
            let entries = CatalogStore::new(&config.catalog_path).load().await?;
            print_catalog_stats(&entries);
        }
    }
    Ok(())
}

fn print_summary(report: &SyncReport) {
    for stats in &report.sources {
        match &stats.error {
            Some(error) => println!("{}: failed ({error})", stats.source_type),
            None => println!("{}: {} listings", stats.source_type, stats.fetched),
        }
    }
    println!(
        "New: {} | Updated: {} | Unchanged: {} | Catalog: {}",
        report.new_count(),
        report.updated_count(),
        report.unchanged,
        report.catalog_size,
    );
    for listing in &report.new_items {
        println!("  + {}", listing_line(listing));
    }
    for listing in &report.updated_items {
        println!("  ~ {}", listing_line(listing));
    }
}

fn listing_line(listing: &Listing) -> String {
    let price = listing
        .price
        .map(|p| format!("₪{p}"))
        .unwrap_or_else(|| "price n/a".to_string());
    let location = if listing.location.is_empty() {
        "location n/a"
    } else {
        listing.location.as_str()
    };
    format!(
        "[{}] {location} | {price} | {}",
        listing.source_type, listing.resource_url
    )
}

fn print_catalog_stats(entries: &BTreeMap<String, Listing>) {
    let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
    for listing in entries.values() {
        *per_source.entry(listing.source_type.as_str()).or_default() += 1;
    }
    println!("{} listings in catalog", entries.len());
    for (source, count) in per_source {
        println!("  {source}: {count}");
    }
}
