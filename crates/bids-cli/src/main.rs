use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bids_adapters::provider_for_source;
use bids_harvest::{
    list_sources, seed_sources, HarvestCommand, HarvestConfig, HarvestService, SourceRegistry,
};
use bids_storage::Database;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bids-cli")]
#[command(about = "Bid harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the embedded schema migrations.
    Migrate,
    /// Upsert sources from the registry file by code.
    SeedSources {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List stored sources.
    Sources,
    /// Run one harvest for a source.
    Harvest {
        #[arg(long)]
        source_code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();
    let db = Database::connect(&config.storage).await?;

    match cli.command.unwrap_or(Commands::Sources) {
        Commands::Migrate => {
            db.migrate().await?;
            println!("migrate complete: database={}", config.storage.database_url);
        }
        Commands::SeedSources { file } => {
            let path = file.unwrap_or_else(|| config.sources_file());
            let registry = SourceRegistry::load(&path).await?;
            let report = seed_sources(&db.unit_of_work_factory(), &registry)
                .await
                .with_context(|| format!("seeding sources from {}", path.display()))?;
            println!(
                "seed complete: created={} updated={}",
                report.created, report.updated
            );
        }
        Commands::Sources => {
            let sources = list_sources(&db.unit_of_work_factory())
                .await
                .context("listing sources")?;
            for source in sources {
                let id = source.id.persisted().map(|id| id.to_string()).unwrap_or_default();
                let status = if source.is_active { "active" } else { "inactive" };
                println!("{id}\t{}\t{}\t{}\t{status}", source.code, source.kind, source.name);
            }
        }
        Commands::Harvest { source_code } => {
            let provider = provider_for_source(&source_code, &config.provider)?;
            let service = HarvestService::new(
                Arc::new(db.unit_of_work_factory()),
                Arc::from(provider),
            );
            let report = service
                .harvest(&HarvestCommand::new(&source_code))
                .await
                .with_context(|| format!("harvesting source {source_code}"))?;
            println!(
                "harvest complete: run_id={} source={} raw_items={} bids={} committed={}",
                report.run_id, report.source_code, report.raw_items, report.bids, report.committed
            );
        }
    }

    Ok(())
}
